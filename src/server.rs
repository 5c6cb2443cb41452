//! DNS server setup and lifecycle management.

use std::sync::Arc;

use hickory_server::ServerFuture;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::ServiceCache;
use crate::config::Config;
use crate::consul::ConsulClient;
use crate::dogstatsd::{Dogstatsd, QueryStats};
use crate::error::Error;
use crate::handler::ConsulHandler;
use crate::metrics;

/// The consul-dns server: a DNS front end over the service cache, plus
/// the optional dogstatsd flusher.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from a validated configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        info!(
            listen_addr = %self.config.dns.listen_addr,
            agent = %self.config.consul.address,
            ttl = ?self.config.consul.ttl(),
            prefetch_amount = self.config.consul.prefetch.amount,
            prefetch_duration_secs = self.config.consul.prefetch.duration_secs,
            prefetch_percentage = self.config.consul.prefetch.percentage,
            "starting consul-dns"
        );

        metrics::register();

        let client = ConsulClient::new(&self.config.consul.address, self.config.consul.ttl())?;
        let cache = ServiceCache::new(client.clone(), &self.config.consul);
        let stats = Arc::new(QueryStats::new());

        let handler = ConsulHandler::new(
            cache,
            client,
            Arc::clone(&stats),
            cancel.clone(),
        );
        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, self.config.dns.tcp_timeout());

        let flusher_handle = match self.config.dogstatsd.clone() {
            Some(dogstatsd_config) => {
                let flusher =
                    Dogstatsd::new(dogstatsd_config, metrics::registry().clone(), stats)?;
                Some(tokio::spawn(flusher.run(cancel.clone())))
            }
            None => None,
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(err) = result {
                    error!(error = %err, "DNS server error");
                }
            }
        }

        if let Some(handle) = flusher_handle {
            let _ = handle.await;
        }

        info!("consul-dns stopped");
        Ok(())
    }
}
