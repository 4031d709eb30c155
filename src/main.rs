//! packet-server: a multi-process TCP packet server
//!
//! Features:
//! - Length-prefixed binary protocol with CRC-32 body checksums
//! - Master process supervising forked worker processes
//! - mio reactor plus business thread pool per worker
//! - Delayed connection recycling, heartbeat timeouts and flood detection
//! - Configuration via CLI arguments or TOML file

use packet_server::config::Config;
use packet_server::process::{self, Supervisor};
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

    info!(
        ports = ?config.ports,
        worker_processes = config.worker_processes,
        worker_threads = config.worker_threads,
        worker_connections = config.worker_connections,
        heartbeat = config.heartbeat.enabled,
        flood = config.flood.enabled,
        "Starting packet-server"
    );

    if config.single_process {
        process::run_single(&config)?;
    } else {
        Supervisor::new(&config).run()?;
    }
    Ok(())
}
