//! matrix-add-server: parallel matrix addition over TCP
//!
//! Configuration via CLI arguments or TOML file; see `config`.

use matrix_add::config::Config;
use matrix_add::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        max_dimension = config.max_dimension,
        max_workers = config.max_workers,
        read_timeout = ?config.read_timeout,
        compute_timeout = ?config.compute_timeout,
        "Starting matrix-add server"
    );

    let server = Server::bind(&config)?;
    server
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received stop signal"),
                Err(e) => error!(error = %e, "Failed to listen for stop signal"),
            }
        })
        .await?;

    Ok(())
}
