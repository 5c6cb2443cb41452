//! consul-dns - Authoritative DNS for the `.consul.` zone backed by a
//! Consul agent, with a Prometheus-to-dogstatsd metrics bridge.
//!
//! This crate answers `A`/`AAAA`/`ANY`/`SRV` queries for names of the
//! form `[TAG.]NAME.service[.DC].consul.` by translating them into
//! service-health lookups against a Consul agent. Lookups go through a
//! single-flight, prefetching, per-entry-TTL cache that trades freshness
//! for throughput, and the server's own Prometheus metrics can be shipped
//! to a dogstatsd agent as incremental datagrams.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          consul-dns                             │
//! │                                                                 │
//! │  UDP/TCP :53 ──▶ ┌──────────────┐     ┌────────────────┐       │
//! │                  │ ConsulHandler │───▶│  ServiceCache  │       │
//! │                  └──────┬────────┘     └───────┬────────┘       │
//! │                         │ top-N               │ single-flight   │
//! │                         ▼                     ▼                 │
//! │                  ┌──────────────┐     ┌────────────────┐       │
//! │                  │  Dogstatsd   │     │  ConsulClient  │──▶ agent
//! │                  │  flusher     │     └────────────────┘  :8500 │
//! │                  └──────┬───────┘                              │
//! │                         └──▶ udp://dogstatsd:8125              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use consul_dns::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config().validate().unwrap();
//!     let cancel = CancellationToken::new();
//!     Server::new(config).run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod consul;
pub mod dogstatsd;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod telemetry;

// Re-export main types
pub use cache::{AddressFamily, Endpoint, Resolution, ServiceCache, ServiceKey};
pub use config::{Config, ConsulConfig, DnsConfig, DogstatsdConfig, TelemetryConfig};
pub use consul::ConsulClient;
pub use error::{Error, LookupError};
pub use handler::ConsulHandler;
pub use server::Server;
