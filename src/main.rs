use sickradar_server::{config, server::Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting SICK Radar Monitor");

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server failed: {e:#}");
        std::process::exit(1);
    }
}
