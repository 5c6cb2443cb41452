//! consul-dns binary entry point.

use std::path::PathBuf;

use clap::Parser;
use consul_dns::{telemetry, Config, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS server for the .consul. zone backed by a Consul agent.
#[derive(Parser, Debug)]
#[command(name = "consul-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "consul-dns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("CONSUL_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    let config = config.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        agent = %config.consul.address,
        "Starting consul-dns"
    );

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    // Run DNS server
    let result = Server::new(config).run(cancel).await;

    if let Err(e) = result {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("consul-dns shutdown complete");
    Ok(())
}
