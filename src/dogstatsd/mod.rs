//! The dogstatsd bridge.
//!
//! Prometheus collects metrics across the server; to publish them to a
//! dogstatsd agent this module acts as an internal collector that scrapes
//! the registry at a fixed interval and ships the translated samples over
//! UDP or Unix datagrams. The interesting part is the impedance mismatch:
//! prometheus counters are cumulative while dogstatsd only wants the
//! increments, and prometheus histograms must be re-expressed as weighted
//! samples. The [`translate`] module holds that state machine.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::proto::Metric;
use prometheus::Registry;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DogstatsdConfig, Target, UdpFamily};
use crate::error::Error;

pub mod counters;
pub mod docker;
pub mod translate;

use counters::CounterStore;
use docker::{DockerClient, DockerHost};
use translate::{Sample, Translator};

/// IPv4 sockets cannot carry datagrams larger than this, whatever the
/// kernel says about its buffers.
const MAX_UDP_DATAGRAM: usize = 65_507;

/// Query-side accounting shared between the DNS handler and the flusher:
/// top-N counters plus the container label cache used to attribute
/// queries to client images.
#[derive(Debug, Default)]
pub struct QueryStats {
    clients: CounterStore,
    names: CounterStore,
    exchanges: CounterStore,
    containers: RwLock<Arc<HashMap<String, Vec<String>>>>,
}

impl QueryStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one query from `src` for `qname`.
    pub fn observe_query(&self, src: IpAddr, qname: &str) {
        let containers = Arc::clone(&self.containers.read());
        if let Some(images) = containers.get(&src.to_string()) {
            for image in images {
                self.clients.incr(image);
                self.exchanges.incr(&format!("{image}/{qname}"));
            }
        }
        self.names.incr(qname);
    }

    /// Replace the container label cache.
    pub fn set_containers(&self, labels: HashMap<String, Vec<String>>) {
        *self.containers.write() = Arc::new(labels);
    }
}

/// The periodic scrape → translate → ship task.
pub struct Dogstatsd<R: Rng = SmallRng> {
    config: DogstatsdConfig,
    target: Target,
    registry: Registry,
    stats: Arc<QueryStats>,
    docker: DockerClient,
    translator: Translator<R>,
    zones: HashSet<String>,
}

impl Dogstatsd<SmallRng> {
    /// Create a flusher scraping `registry` with a system-seeded RNG.
    pub fn new(
        config: DogstatsdConfig,
        registry: Registry,
        stats: Arc<QueryStats>,
    ) -> Result<Self, Error> {
        Self::with_rng(config, registry, stats, SmallRng::from_entropy())
    }
}

impl<R: Rng> Dogstatsd<R> {
    /// Create a flusher drawing histogram samples from `rng`.
    pub fn with_rng(
        config: DogstatsdConfig,
        registry: Registry,
        stats: Arc<QueryStats>,
        rng: R,
    ) -> Result<Self, Error> {
        let target = config.target()?;
        let docker = DockerClient::new(
            config
                .docker_host
                .as_deref()
                .and_then(DockerHost::parse),
        );
        let zones = config.zones.iter().cloned().collect();
        Ok(Self {
            config,
            target,
            registry,
            stats,
            docker,
            translator: Translator::with_rng(rng),
            zones,
        })
    }

    /// Run the flush loop until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            addr = %self.config.address,
            buffer = self.config.buffer_size,
            flush = ?self.config.flush_interval(),
            runtime = self.config.runtime_metrics,
            process = self.config.process_metrics,
            zones = ?self.config.zones,
            "starting dogstatsd flusher"
        );

        let mut ticker = tokio::time::interval(self.config.flush_interval());
        // The first tick completes immediately; consume it so the loop
        // body runs once per period.
        ticker.tick().await;

        loop {
            self.refresh_containers().await;
            self.pulse().await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("dogstatsd flusher shutting down");
                    return;
                }
            }
        }
    }

    /// Collect and ship one flush. Errors are logged; the next pulse
    /// starts fresh.
    pub async fn pulse(&mut self) {
        let samples = self.collect();
        debug!(samples = samples.len(), target = %self.config.address, "flushing metrics");
        if let Err(err) = self.flush(&samples).await {
            error!(target = %self.config.address, error = %err, "flushing metrics failed");
        }
    }

    /// Scrape the registry and translate everything that changed, then
    /// append the synthetic top-10 counters.
    fn collect(&mut self) -> Vec<Sample> {
        let families = self.registry.gather();
        let mut samples = Vec::with_capacity(2 * families.len());

        for family in &families {
            let name = family.get_name();
            if !self.config.runtime_metrics && name.starts_with("tokio_") {
                continue;
            }
            if !self.config.process_metrics && name.starts_with("process_") {
                continue;
            }

            for metric in family.get_metric() {
                if !self.matches_zones(metric) {
                    continue;
                }
                for sample in self
                    .translator
                    .expand(name, family.get_field_type(), metric)
                {
                    if let Some(sample) = self.translator.observe(sample) {
                        samples.push(sample);
                    }
                }
            }
        }

        for (client, count) in self.stats.clients.top(10) {
            samples.push(Sample::counter_with_tag(
                "consul_dns.clients.top10",
                count,
                "client",
                &client,
            ));
        }
        for (name, count) in self.stats.names.top(10) {
            samples.push(Sample::counter_with_tag(
                "consul_dns.names.top10",
                count,
                "name",
                &name,
            ));
        }
        for (exchange, count) in self.stats.exchanges.top(10) {
            samples.push(Sample::counter_with_tag(
                "consul_dns.exchanges.top10",
                count,
                "exchange",
                &exchange,
            ));
        }

        samples
    }

    /// Samples with a `zone` label pass only when the zone is allowed;
    /// samples without one always pass.
    fn matches_zones(&self, metric: &Metric) -> bool {
        if self.zones.is_empty() {
            return true;
        }
        let mut has_zone = false;
        for label in metric.get_label() {
            if label.get_name() == "zone" {
                has_zone = true;
                if self.zones.contains(label.get_value()) {
                    return true;
                }
            }
        }
        !has_zone
    }

    /// Refresh the container label cache from the container endpoint.
    async fn refresh_containers(&self) {
        if !self.docker.is_configured() {
            return;
        }
        match self.docker.list_containers().await {
            Ok(containers) => {
                let labels = docker::label_containers(&containers);
                debug!(addresses = labels.len(), "refreshed container labels");
                self.stats.set_containers(labels);
            }
            Err(err) => error!(error = %err, "listing containers failed"),
        }
    }

    /// Pack the samples greedily into datagrams no larger than the
    /// negotiated buffer size and send them. A single sample larger than
    /// the buffer is logged and dropped; the rest of the stream is
    /// unaffected.
    async fn flush(&self, samples: &[Sample]) -> Result<(), Error> {
        let (conn, size) = dial(&self.target, self.config.buffer_size).await?;

        let mut out: Vec<u8> = Vec::with_capacity(size);
        let mut line: Vec<u8> = Vec::with_capacity(size);

        for sample in samples {
            line.clear();
            translate::encode(&mut line, sample);

            if line.len() > size {
                warn!(
                    bytes = line.len(),
                    limit = size,
                    name = %sample.name,
                    "metric exceeds the datagram buffer size, dropping"
                );
                continue;
            }

            if out.len() + line.len() > size {
                conn.send(&out).await?;
                out.clear();
            }
            out.extend_from_slice(&line);
        }

        if !out.is_empty() {
            conn.send(&out).await?;
        }
        Ok(())
    }
}

enum FlushConn {
    Udp(tokio::net::UdpSocket),
    Unix(tokio::net::UnixDatagram),
}

impl FlushConn {
    async fn send(&self, buf: &[u8]) -> Result<(), Error> {
        match self {
            FlushConn::Udp(socket) => socket.send(buf).await?,
            FlushConn::Unix(socket) => socket.send(buf).await?,
        };
        Ok(())
    }
}

/// Dial the flush target and negotiate the usable datagram size.
///
/// The kernel refuses datagrams larger than the socket send buffer, and
/// only half of `SO_SNDBUF` is available to user space. The buffer is
/// raised toward the configured hint where permitted, clamped to the
/// largest IPv4 UDP payload, and finally capped by the hint so the
/// receiver's limits stay in control.
async fn dial(target: &Target, hint: usize) -> Result<(FlushConn, usize), Error> {
    match target {
        Target::Unixgram { path } => {
            let socket = tokio::net::UnixDatagram::unbound()?;
            socket.connect(path)?;
            Ok((FlushConn::Unix(socket), hint))
        }
        Target::Udp { addr, family } => {
            let mut addrs = tokio::net::lookup_host(addr.as_str()).await?;
            let resolved = addrs
                .find(|candidate| match family {
                    UdpFamily::Any => true,
                    UdpFamily::V4 => candidate.is_ipv4(),
                    UdpFamily::V6 => candidate.is_ipv6(),
                })
                .ok_or_else(|| {
                    Error::Config(format!("no matching address family for {addr}"))
                })?;

            let domain = if resolved.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
            socket.connect(&SockAddr::from(resolved))?;

            let mut size = socket.send_buffer_size()? / 2;
            let mut raise = hint;
            while raise > size && raise > 0 {
                if socket.set_send_buffer_size(raise).is_ok() {
                    size = raise;
                    break;
                }
                raise /= 2;
            }
            size = size.min(MAX_UDP_DATAGRAM).min(hint);

            socket.set_nonblocking(true)?;
            let socket = tokio::net::UdpSocket::from_std(socket.into())?;
            Ok((FlushConn::Udp(socket), size))
        }
    }
}
