//! packetlog: a line-oriented append/replay TCP service
//!
//! Every client streams newline-terminated packets into one shared log
//! file. When a packet completes, the whole log is sent back to that
//! client. A background task appends a timestamp record on a fixed
//! interval.
//!
//! Features:
//! - One coarse lock serializing every append and replay
//! - A registry of live workers joined at shutdown
//! - Graceful stop on SIGINT/SIGTERM; the log file is removed on exit
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod daemon;
mod error;
mod registry;
mod server;
mod shared_log;
mod shutdown;
mod timestamp;

use config::Config;
use error::Error;
use server::Server;
use tracing::{error, info};
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
        listen = %config.listen,
        log_path = %config.log_path.display(),
        timestamp_interval = config.timestamp_interval,
        max_workers = config.max_workers,
        daemon = config.daemon,
        "Starting packetlog"
    );

    // Bind before detaching so address errors reach the terminal
    let listener = server::bind(&config.listen, config.backlog)?;

    if config.daemon {
        daemon::daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::setup("building tokio runtime", e))?;

    if let Err(e) = runtime.block_on(serve(config, listener)) {
        error!(error = %e, fatal = e.is_fatal(), "Service failed");
        return Err(e.into());
    }

    info!("Exiting");
    Ok(())
}

/// Install signal handlers, open the log, and run until told to stop.
async fn serve(config: Config, listener: std::net::TcpListener) -> error::Result<()> {
    let signal = shutdown::termination_signal()?;
    let server = Server::new(config, listener).await?;
    server.run(signal).await
}
