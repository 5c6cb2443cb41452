//! Cache instrumentation for consul-dns.
//!
//! All metrics live on a process-wide [`prometheus::Registry`], which is
//! also the registry the dogstatsd bridge scrapes.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

const NAMESPACE: &str = "consul_dns";
const SUBSYSTEM: &str = "cache";

const SUCCESS: &str = "success";
const DENIAL: &str = "denial";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide metric registry.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

static CACHE_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    let gauge = GaugeVec::new(
        Opts::new("size", "The number of elements in the cache.")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["type"],
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registers once");
    gauge
});

static CACHE_SERVICES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::with_opts(
        Opts::new(
            "services_total",
            "The number of service endpoints held by the cache.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registers once");
    gauge
});

static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("hits_total", "The count of cache hits.")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &["type"],
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers once");
    counter
});

static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new("misses_total", "The count of cache misses.")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers once");
    counter
});

static CACHE_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new("evictions_total", "The count of cache evictions.")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers once");
    counter
});

static CACHE_PREFETCHES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new(
            "prefetch_total",
            "The number of times the cache has prefetched a cached item.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registers once");
    counter
});

static CACHE_FETCH_SIZES: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fetch_size",
            "The distribution of response sizes to Consul requests.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .buckets(vec![
            1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
        ]),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registers once");
    histogram
});

static CACHE_FETCH_DURATIONS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fetch_duration_seconds",
            "The distribution of response times to Consul requests.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .buckets(vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0,
        ]),
    )
    .expect("metric options are valid");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registers once");
    histogram
});

/// Force-register every metric and pre-create label values so that gauges
/// and counters show up in the first scrape even before first use.
pub fn register() {
    CACHE_SIZE.with_label_values(&[SUCCESS]);
    CACHE_SIZE.with_label_values(&[DENIAL]);
    CACHE_HITS.with_label_values(&[SUCCESS]);
    CACHE_HITS.with_label_values(&[DENIAL]);
    Lazy::force(&CACHE_SERVICES);
    Lazy::force(&CACHE_MISSES);
    Lazy::force(&CACHE_EVICTIONS);
    Lazy::force(&CACHE_PREFETCHES);
    Lazy::force(&CACHE_FETCH_SIZES);
    Lazy::force(&CACHE_FETCH_DURATIONS);
}

/// Record that a positive entry was added (`n = 1`) or removed (`n = -1`),
/// along with the number of endpoints it carried.
pub fn record_entry_success(n: i64, endpoints: usize) {
    CACHE_SIZE.with_label_values(&[SUCCESS]).add(n as f64);
    CACHE_SERVICES.add(n * endpoints as i64);
}

/// Record that a negative entry was added (`n = 1`) or removed (`n = -1`).
pub fn record_entry_denial(n: i64) {
    CACHE_SIZE.with_label_values(&[DENIAL]).add(n as f64);
}

/// Record a lookup served from a positive entry.
pub fn record_hit_success() {
    CACHE_HITS.with_label_values(&[SUCCESS]).inc();
}

/// Record a lookup served from a negative entry.
pub fn record_hit_denial() {
    CACHE_HITS.with_label_values(&[DENIAL]).inc();
}

/// Record a cold lookup that triggered the first fetch for a key.
pub fn record_miss() {
    CACHE_MISSES.inc();
}

/// Record an entry removed by the cleanup pass.
pub fn record_eviction() {
    CACHE_EVICTIONS.inc();
}

/// Record a prefetch refresh.
pub fn record_prefetch() {
    CACHE_PREFETCHES.inc();
}

/// Record the endpoint count of a successful fetch.
pub fn record_fetch_size(endpoints: usize) {
    CACHE_FETCH_SIZES.observe(endpoints as f64);
}

/// Record the round-trip time of a fetch, successful or not.
pub fn record_fetch_duration(rtt: Duration) {
    CACHE_FETCH_DURATIONS.observe(rtt.as_secs_f64());
}
