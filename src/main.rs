//! echoport: a dual-transport echo server
//!
//! Serves stream (TCP) and datagram (UDP) clients on the same port from a
//! single-threaded readiness-multiplexed event loop.
//!
//! Features:
//! - Non-command input is echoed back to the sender on the transport it
//!   arrived on
//! - Text commands: `/time`, `/stats`, `/shutdown`
//! - Connection accounting readable from outside the loop
//! - Configuration via CLI arguments or TOML file

mod command;
mod config;
mod server;
mod stats;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(listen = %config.listen, "Starting echoport server");

    let server = Server::bind(&config)?;
    server.run()?;

    info!("Server exited");
    Ok(())
}
