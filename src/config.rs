//! Configuration types for consul-dns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Consul service cache configuration.
    #[serde(default)]
    pub consul: ConsulConfig,

    /// Dogstatsd bridge configuration. Absent means metrics are collected
    /// but never shipped.
    #[serde(default)]
    pub dogstatsd: Option<DogstatsdConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Validate the configuration, normalising addresses in place.
    ///
    /// A configuration that fails validation refuses to start the server.
    pub fn validate(mut self) -> Result<Self, Error> {
        self.consul = self.consul.validate()?;
        if let Some(dogstatsd) = self.dogstatsd.take() {
            self.dogstatsd = Some(dogstatsd.validate()?);
        }
        Ok(self)
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Idle timeout for TCP connections, in seconds.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
}

impl DnsConfig {
    /// TCP idle timeout as a [`Duration`].
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

/// Consul service cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Address of the Consul agent, in `scheme://host:port` format.
    /// A missing scheme defaults to `http://`.
    #[serde(default = "default_agent_addr")]
    pub address: String,

    /// Maximum age of cached service entries, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Cache prefetcher configuration.
    #[serde(default)]
    pub prefetch: PrefetchConfig,
}

impl ConsulConfig {
    /// Entry lifetime as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    fn validate(mut self) -> Result<Self, Error> {
        if !self.address.contains("://") {
            self.address = format!("http://{}", self.address);
        }
        self.prefetch = self.prefetch.validate()?;
        Ok(self)
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_agent_addr(),
            ttl_secs: default_ttl_secs(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

/// Configuration of the cache prefetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Number of lookups within an entry's lifetime that arms the
    /// prefetcher for that entry.
    #[serde(default = "default_prefetch_amount")]
    pub amount: u64,

    /// Window over which lookups are counted toward `amount`, in seconds.
    #[serde(default = "default_prefetch_duration_secs")]
    pub duration_secs: u64,

    /// Percentage of the TTL that defines the prefetch deadline.
    /// Must fall in `[10, 90]`.
    #[serde(default = "default_prefetch_percentage")]
    pub percentage: u32,
}

impl PrefetchConfig {
    fn validate(self) -> Result<Self, Error> {
        if self.amount == 0 {
            return Err(Error::Config(
                "prefetch amount must be positive".to_string(),
            ));
        }
        if self.duration_secs == 0 {
            return Err(Error::Config(
                "prefetch duration must be positive".to_string(),
            ));
        }
        if !(10..=90).contains(&self.percentage) {
            return Err(Error::Config(format!(
                "prefetch percentage must fall in range [10, 90]: {}",
                self.percentage
            )));
        }
        Ok(self)
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            amount: default_prefetch_amount(),
            duration_secs: default_prefetch_duration_secs(),
            percentage: default_prefetch_percentage(),
        }
    }
}

/// Dogstatsd bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DogstatsdConfig {
    /// Address of the dogstatsd agent, in `[scheme://]host:port` format.
    /// Valid schemes are `udp`, `udp4`, `udp6` and `unixgram`; a missing
    /// scheme defaults to `udp`.
    #[serde(default = "default_dogstatsd_addr")]
    pub address: String,

    /// Size hint for the socket buffer used to push metrics, in bytes.
    /// Must fall in `[512, 65536]`.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Interval between flushes, in seconds. Must be at least one second.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Ship language-runtime (`tokio_*`) metric families.
    #[serde(default)]
    pub runtime_metrics: bool,

    /// Ship process-level (`process_*`) metric families.
    #[serde(default)]
    pub process_metrics: bool,

    /// Zones this bridge reports metrics for. Samples carrying a `zone`
    /// label pass only when the value is listed here; an empty list
    /// matches everything.
    #[serde(default)]
    pub zones: Vec<String>,

    /// Container endpoint used to label clients by image name. Defaults
    /// to the `DOCKER_HOST` environment variable; empty disables the
    /// container cache.
    #[serde(default = "default_docker_host")]
    pub docker_host: Option<String>,
}

impl DogstatsdConfig {
    /// Flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Parse the configured address into a dial target.
    pub fn target(&self) -> Result<Target, Error> {
        let (scheme, rest) = match self.address.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("udp", self.address.as_str()),
        };
        match scheme {
            "udp" => Ok(Target::Udp {
                addr: rest.to_string(),
                family: UdpFamily::Any,
            }),
            "udp4" => Ok(Target::Udp {
                addr: rest.to_string(),
                family: UdpFamily::V4,
            }),
            "udp6" => Ok(Target::Udp {
                addr: rest.to_string(),
                family: UdpFamily::V6,
            }),
            "unixgram" => Ok(Target::Unixgram {
                path: PathBuf::from(rest),
            }),
            other => Err(Error::Config(format!("unsupported protocol: {other}"))),
        }
    }

    fn validate(mut self) -> Result<Self, Error> {
        if !self.address.contains("://") {
            self.address = format!("udp://{}", self.address);
        }
        self.target()?;
        if self.buffer_size < 512 {
            return Err(Error::Config(format!(
                "the buffer size must be at least 512 B, got {} B",
                self.buffer_size
            )));
        }
        if self.buffer_size > 65536 {
            return Err(Error::Config(format!(
                "the buffer size must be at most 65536 B, got {} B",
                self.buffer_size
            )));
        }
        if self.flush_interval_secs < 1 {
            return Err(Error::Config(
                "the flush interval must be at least 1s".to_string(),
            ));
        }
        Ok(self)
    }
}

impl Default for DogstatsdConfig {
    fn default() -> Self {
        Self {
            address: default_dogstatsd_addr(),
            buffer_size: default_buffer_size(),
            flush_interval_secs: default_flush_interval_secs(),
            runtime_metrics: false,
            process_metrics: false,
            zones: Vec::new(),
            docker_host: default_docker_host(),
        }
    }
}

/// A parsed dogstatsd dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A UDP endpoint, optionally restricted to one address family.
    Udp {
        /// `host:port` to resolve and connect to.
        addr: String,
        /// Address family restriction.
        family: UdpFamily,
    },
    /// A Unix datagram socket path.
    Unixgram {
        /// Filesystem path of the socket.
        path: PathBuf,
    },
}

/// Address family restriction for UDP targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpFamily {
    /// Either family.
    Any,
    /// IPv4 only (`udp4://`).
    V4,
    /// IPv6 only (`udp6://`).
    V6,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "consul_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_agent_addr() -> String {
    "http://localhost:8500".to_string()
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_prefetch_amount() -> u64 {
    2
}

fn default_prefetch_duration_secs() -> u64 {
    60
}

fn default_prefetch_percentage() -> u32 {
    10
}

fn default_dogstatsd_addr() -> String {
    "udp://localhost:8125".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_docker_host() -> Option<String> {
    std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty())
}

fn default_log_level() -> String {
    "info".to_string()
}
