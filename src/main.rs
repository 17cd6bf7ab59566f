//! line-dispatch: a failover proxy for line-based key/value backends
//!
//! Each configured app listens on one or more front-end addresses and owns
//! an ordered list of backend targets. Every request line a client sends is
//! forwarded to the first target that answers, trying them in order.
//!
//! Features:
//! - Deterministic failover in configured target order
//! - Bounded connect and exchange timeouts per backend
//! - Optional deadline per request across all backends
//! - Configuration via CLI arguments or TOML file

use line_dispatch::config::Config;
use line_dispatch::server::Server;
use tracing::info;
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
        apps = config.apps.len(),
        connect_timeout_ms = config.dispatch.connect_timeout.as_millis() as u64,
        exchange_timeout_ms = config.dispatch.exchange_timeout.as_millis() as u64,
        request_deadline_ms = config.dispatch.request_deadline.map(|d| d.as_millis() as u64),
        max_connections = config.max_connections,
        "Starting line-dispatch proxy"
    );

    let server = Server::bind(&config).await?;
    server.run().await?;
    Ok(())
}
