//! Translation of Prometheus-shaped samples into dogstatsd emissions.
//!
//! Prometheus counters are cumulative and dogstatsd counters are
//! incremental, so the translator remembers the previous scrape per
//! `(kind, name, tags, bucket)` key and emits only the change. Gauges map
//! one-to-one and are re-emitted on every flush so the receiver never
//! expires the series. Each histogram bucket becomes a single weighted
//! sample: a random value inside the bucket's bounds at a rate of
//! `1 / observations`, which lets the aggregator reconstruct the count.

use std::collections::HashMap;
use std::fmt::Write as _;

use prometheus::proto::{Metric, MetricType};
use rand::Rng;

/// The dogstatsd metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Incremental counter (`|c`).
    Counter,
    /// Point-in-time gauge (`|g`).
    Gauge,
    /// Weighted histogram sample (`|h`).
    Histogram,
}

impl SampleKind {
    fn symbol(self) -> u8 {
        match self {
            SampleKind::Counter => b'c',
            SampleKind::Gauge => b'g',
            SampleKind::Histogram => b'h',
        }
    }
}

/// One translated sample, ready to serialise.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Metric kind.
    pub kind: SampleKind,
    /// Metric name; canonicalised at serialisation time.
    pub name: String,
    /// Emitted value.
    pub value: f64,
    /// Sample rate; printed only when it is neither 0 nor 1.
    pub rate: f64,
    /// Canonical `k:v,k:v` tag string, possibly empty.
    pub tags: String,

    // Histogram bookkeeping: bucket position, per-bucket observation
    // count, and the bucket's cumulative count acting as a version.
    bucket: usize,
    count: u64,
    version: u64,
}

impl Sample {
    /// A plain counter sample with one `tag:value` tag.
    pub fn counter_with_tag(name: &str, value: i64, tag: &str, tag_value: &str) -> Self {
        Self {
            kind: SampleKind::Counter,
            name: name.to_string(),
            value: value as f64,
            rate: 1.0,
            tags: format!("{tag}:{tag_value}"),
            bucket: 0,
            count: 0,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LastSample {
    value: f64,
    count: u64,
    version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    kind: SampleKind,
    name: String,
    tags: String,
    bucket: usize,
}

/// Stateful cumulative-to-incremental translator.
///
/// The state lives exactly as long as its flusher and is never shared.
pub struct Translator<R> {
    last: HashMap<StateKey, LastSample>,
    rng: R,
}

impl<R: Rng> Translator<R> {
    /// Create a translator drawing histogram values from `rng`.
    pub fn with_rng(rng: R) -> Self {
        Self {
            last: HashMap::new(),
            rng,
        }
    }

    /// Expand one scraped metric into zero or more raw samples.
    ///
    /// Summary and untyped families are skipped. Histograms produce one
    /// sample per bucket carrying a value drawn uniformly from the
    /// bucket's bounds.
    pub fn expand(&mut self, name: &str, kind: MetricType, metric: &Metric) -> Vec<Sample> {
        let tags = make_tags(metric);

        match kind {
            MetricType::COUNTER => vec![Sample {
                kind: SampleKind::Counter,
                name: name.to_string(),
                value: metric.get_counter().get_value(),
                rate: 1.0,
                tags,
                bucket: 0,
                count: 0,
                version: 0,
            }],

            MetricType::GAUGE => vec![Sample {
                kind: SampleKind::Gauge,
                name: name.to_string(),
                value: metric.get_gauge().get_value(),
                rate: 1.0,
                tags,
                bucket: 0,
                count: 0,
                version: 0,
            }],

            MetricType::HISTOGRAM => {
                let buckets = metric.get_histogram().get_bucket();
                let mut samples = Vec::with_capacity(buckets.len());
                let mut acc = 0u64;
                let mut lower = 0.0f64;

                for (bucket, proto_bucket) in buckets.iter().enumerate() {
                    let cumulative = proto_bucket.get_cumulative_count();
                    let upper = proto_bucket.get_upper_bound();
                    // The +Inf bucket has no width to sample from.
                    let value = if upper.is_finite() {
                        lower + (upper - lower) * self.rng.gen::<f64>()
                    } else {
                        lower
                    };

                    samples.push(Sample {
                        kind: SampleKind::Histogram,
                        name: name.to_string(),
                        value,
                        rate: 1.0,
                        tags: tags.clone(),
                        bucket,
                        count: cumulative - acc,
                        version: cumulative,
                    });

                    acc = cumulative;
                    lower = upper;
                }

                samples
            }

            _ => Vec::new(),
        }
    }

    /// Feed one sample through the state machine, returning the emission
    /// if anything changed since the previous scrape.
    pub fn observe(&mut self, mut sample: Sample) -> Option<Sample> {
        let key = StateKey {
            kind: sample.kind,
            name: sample.name.clone(),
            tags: sample.tags.clone(),
            bucket: sample.bucket,
        };
        let last = self.last.get(&key).copied().unwrap_or_default();

        match sample.kind {
            SampleKind::Counter => {
                let mut delta = sample.value - last.value;
                if delta < 0.0 {
                    // Counter reset; report the raw value.
                    delta = sample.value;
                }
                if delta == 0.0 {
                    return None;
                }
                self.last.insert(
                    key,
                    LastSample {
                        value: sample.value,
                        ..last
                    },
                );
                sample.value = delta;
                Some(sample)
            }

            SampleKind::Gauge => {
                self.last.insert(
                    key,
                    LastSample {
                        value: sample.value,
                        ..last
                    },
                );
                Some(sample)
            }

            SampleKind::Histogram => {
                // The cumulative count only changes when this bucket or a
                // lower one saw observations; the per-bucket delta tells
                // which. Both must have moved for this bucket to emit.
                let count = sample.count.wrapping_sub(last.count);
                if sample.version == last.version || count == 0 {
                    return None;
                }
                sample.rate = 1.0 / count as f64;
                self.last.insert(
                    key,
                    LastSample {
                        value: sample.value,
                        count: sample.count,
                        version: sample.version,
                    },
                );
                Some(sample)
            }
        }
    }
}

/// Serialise one sample as `name:value|kind[|@rate][|#tags]\n`.
pub fn encode(buf: &mut Vec<u8>, sample: &Sample) {
    append_name(buf, &sample.name);
    buf.push(b':');
    append_float(buf, sample.value);
    buf.push(b'|');
    buf.push(sample.kind.symbol());

    if sample.rate != 0.0 && sample.rate != 1.0 {
        buf.extend_from_slice(b"|@");
        append_float(buf, sample.rate);
    }

    if !sample.tags.is_empty() {
        buf.extend_from_slice(b"|#");
        buf.extend_from_slice(sample.tags.as_bytes());
    }

    buf.push(b'\n');
}

/// Shortest round-trippable decimal form of `value`.
fn append_float(buf: &mut Vec<u8>, value: f64) {
    let mut formatted = String::with_capacity(24);
    let _ = write!(formatted, "{value}");
    buf.extend_from_slice(formatted.as_bytes());
}

/// Canonicalise a metric name into the dogstatsd alphabet.
///
/// Underscores become periods: dogstatsd namespaces with periods where
/// prometheus uses underscores, and replacing them wholesale beats
/// guessing which underscores delimit a namespace.
fn append_name(buf: &mut Vec<u8>, name: &str) {
    for c in name.chars() {
        match c {
            '_' => buf.push(b'.'),
            c if is_valid_name_char(c) => buf.push(c as u8),
            _ => buf.push(b'_'),
        }
    }
}

fn append_tag_name(buf: &mut Vec<u8>, name: &str) {
    for c in name.chars() {
        match c {
            ':' => buf.push(b'_'),
            'A'..='Z' => buf.push(c.to_ascii_lowercase() as u8),
            c if is_valid_tag_char(c) => buf.push(c as u8),
            _ => buf.push(b'_'),
        }
    }
}

fn append_tag_value(buf: &mut Vec<u8>, value: &str) {
    for c in value.chars() {
        match c {
            'A'..='Z' => buf.push(c.to_ascii_lowercase() as u8),
            c if is_valid_tag_char(c) => buf.push(c as u8),
            _ => buf.push(b'_'),
        }
    }
}

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn is_valid_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | ':')
}

/// Canonical `k:v,k:v` tag string for a scraped metric.
fn make_tags(metric: &Metric) -> String {
    let labels = metric.get_label();
    if labels.is_empty() {
        return String::new();
    }

    let mut buf = Vec::with_capacity(20 * labels.len());
    for (i, label) in labels.iter().enumerate() {
        if i != 0 {
            buf.push(b',');
        }
        append_tag_name(&mut buf, label.get_name());
        buf.push(b':');
        append_tag_value(&mut buf, label.get_value());
    }

    // The canonical alphabet is pure ASCII.
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn translator() -> Translator<StepRng> {
        // All-zero random bits make histogram samples land exactly on the
        // lower bucket bound.
        Translator::with_rng(StepRng::new(0, 0))
    }

    fn counter_sample(name: &str, value: f64) -> Sample {
        Sample {
            kind: SampleKind::Counter,
            name: name.to_string(),
            value,
            rate: 1.0,
            tags: String::new(),
            bucket: 0,
            count: 0,
            version: 0,
        }
    }

    fn encoded(sample: &Sample) -> String {
        let mut buf = Vec::new();
        encode(&mut buf, sample);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_counter_emits_deltas_and_suppresses_zero() {
        let mut translator = translator();

        // Cumulative values 0, 1, 3, 6, ... as in a counter incremented
        // by i at tick i; emissions are the deltas 1, 2, 3, ...
        let mut total = 0.0;
        let mut emitted = Vec::new();
        for i in 0..20 {
            total += i as f64;
            if let Some(sample) = translator.observe(counter_sample("counter", total)) {
                emitted.push(sample.value);
            }
        }

        let expected: Vec<f64> = (1..20).map(|i| i as f64).collect();
        assert_eq!(emitted, expected);
    }

    #[test]
    fn test_counter_reset_reports_raw_value() {
        let mut translator = translator();

        assert_eq!(
            translator.observe(counter_sample("counter", 10.0)).unwrap().value,
            10.0
        );
        assert_eq!(
            translator.observe(counter_sample("counter", 14.0)).unwrap().value,
            4.0
        );
        // The process restarted and the counter fell back to 3.
        assert_eq!(
            translator.observe(counter_sample("counter", 3.0)).unwrap().value,
            3.0
        );
    }

    #[test]
    fn test_gauge_always_emits() {
        let mut translator = translator();
        let gauge = Sample {
            kind: SampleKind::Gauge,
            name: "fuel_level".to_string(),
            value: 0.5,
            rate: 1.0,
            tags: String::new(),
            bucket: 0,
            count: 0,
            version: 0,
        };

        assert!(translator.observe(gauge.clone()).is_some());
        assert!(translator.observe(gauge.clone()).is_some());
        assert!(translator.observe(gauge).is_some());
    }

    #[test]
    fn test_histogram_buckets_weighted_by_rate() {
        use prometheus::core::Collector;
        use prometheus::{Histogram, HistogramOpts};

        let histogram = Histogram::with_opts(
            HistogramOpts::new("histogram1", "test")
                .buckets((1..=10).map(|i| (i * 10) as f64).collect()),
        )
        .unwrap();
        for value in 1..=100 {
            histogram.observe(value as f64);
        }

        let family = histogram.collect().remove(0);
        let metric = &family.get_metric()[0];

        let mut translator = translator();
        let samples: Vec<Sample> = translator
            .expand(family.get_name(), family.get_field_type(), metric)
            .into_iter()
            .filter_map(|sample| translator.observe(sample))
            .collect();

        // Ten observations per bucket; each bucket yields a single sample
        // at its lower bound with rate 1/10.
        assert_eq!(samples.len(), 10);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.value, (i * 10) as f64);
            assert_eq!(sample.rate, 0.1);
        }

        // Nothing changed since the last scrape; everything suppresses.
        let family = histogram.collect().remove(0);
        let metric = &family.get_metric()[0];
        let unchanged: Vec<Sample> = translator
            .expand(family.get_name(), family.get_field_type(), metric)
            .into_iter()
            .filter_map(|sample| translator.observe(sample))
            .collect();
        assert!(unchanged.is_empty());
    }

    #[test]
    fn test_encode_line_format() {
        let cases = [
            (
                Sample {
                    kind: SampleKind::Counter,
                    name: "test.metric.small".to_string(),
                    value: 0.0,
                    rate: 1.0,
                    tags: String::new(),
                    bucket: 0,
                    count: 0,
                    version: 0,
                },
                "test.metric.small:0|c\n",
            ),
            (
                Sample {
                    kind: SampleKind::Counter,
                    name: "test.metric.common".to_string(),
                    value: 1.0,
                    rate: 1.0,
                    tags: "hello:world,answer:42".to_string(),
                    bucket: 0,
                    count: 0,
                    version: 0,
                },
                "test.metric.common:1|c|#hello:world,answer:42\n",
            ),
            (
                Sample {
                    kind: SampleKind::Counter,
                    name: "test.metric.large".to_string(),
                    value: 1.234,
                    rate: 0.1,
                    tags: "hello:world".to_string(),
                    bucket: 0,
                    count: 0,
                    version: 0,
                },
                "test.metric.large:1.234|c|@0.1|#hello:world\n",
            ),
            (
                Sample {
                    kind: SampleKind::Gauge,
                    name: "fuel.level".to_string(),
                    value: 0.5,
                    rate: 1.0,
                    tags: String::new(),
                    bucket: 0,
                    count: 0,
                    version: 0,
                },
                "fuel.level:0.5|g\n",
            ),
            (
                Sample {
                    kind: SampleKind::Histogram,
                    name: "song.length".to_string(),
                    value: 240.0,
                    rate: 0.5,
                    tags: String::new(),
                    bucket: 0,
                    count: 0,
                    version: 0,
                },
                "song.length:240|h|@0.5\n",
            ),
        ];

        for (sample, expected) in cases {
            assert_eq!(encoded(&sample), expected);
        }
    }

    #[test]
    fn test_name_canonicalisation() {
        let sample = counter_sample("consul_dns_cache_hits_total", 1.0);
        let mut translator = translator();
        let sample = translator.observe(sample).unwrap();
        assert_eq!(encoded(&sample), "consul.dns.cache.hits.total:1|c\n");
    }

    #[test]
    fn test_tag_canonicalisation() {
        let mut buf = Vec::new();
        append_tag_name(&mut buf, "Zone:Name");
        assert_eq!(buf, b"zone_name");

        buf.clear();
        append_tag_value(&mut buf, "Mixed Case/value-1");
        assert_eq!(buf, b"mixed_case/value-1");
    }

    #[test]
    fn test_round_trip_kind_and_value() {
        let sample = Sample {
            kind: SampleKind::Histogram,
            name: "users.uniques".to_string(),
            value: 1234.5,
            rate: 0.25,
            tags: String::new(),
            bucket: 0,
            count: 0,
            version: 0,
        };

        let line = encoded(&sample);
        let line = line.trim_end();
        let (name_value, rest) = line.split_once('|').unwrap();
        let (name, value) = name_value.split_once(':').unwrap();
        let mut parts = rest.split('|');

        assert_eq!(name, "users.uniques");
        assert_eq!(value.parse::<f64>().unwrap(), sample.value);
        assert_eq!(parts.next(), Some("h"));
        assert_eq!(parts.next(), Some("@0.25"));
    }
}
