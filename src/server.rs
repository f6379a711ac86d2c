//! TCP listener and dispatch loop.
//!
//! Accepts connections, spawns one registered worker per connection, reaps
//! finished workers, and hands over to the shutdown coordinator once the
//! service stops.

use crate::config::Config;
use crate::connection;
use crate::error::{Error, Result};
use crate::registry::{WorkerKind, WorkerRegistry};
use crate::shared_log::SharedLog;
use crate::shutdown::{ShutdownCoordinator, TerminationFlag};
use crate::timestamp;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often finished workers are reaped while no connections arrive.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Create, bind and listen on `addr` without involving the async runtime.
///
/// Called before daemonizing so bind failures reach the terminal.
pub fn bind(addr: &str, backlog: i32) -> Result<std::net::TcpListener> {
    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::setup(
            format!("parsing listen address '{addr}'"),
            io::Error::new(io::ErrorKind::InvalidInput, e),
        )
    })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| Error::setup("creating socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::setup("setting SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::setup("setting non-blocking mode", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::setup(format!("binding {addr}"), e))?;
    socket
        .listen(backlog)
        .map_err(|e| Error::setup(format!("listening on {addr}"), e))?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    log: Arc<SharedLog>,
    registry: Arc<WorkerRegistry>,
    coordinator: ShutdownCoordinator,
}

impl Server {
    /// Take ownership of a bound listener and open the shared log.
    pub async fn new(config: Config, listener: std::net::TcpListener) -> Result<Self> {
        let listener = TcpListener::from_std(listener)
            .map_err(|e| Error::setup("registering listener with runtime", e))?;
        let log = SharedLog::create(&config.log_path).await?;
        let registry = Arc::new(WorkerRegistry::new(config.max_workers));
        let coordinator = ShutdownCoordinator::new(
            TerminationFlag::new(),
            Arc::clone(&registry),
            Arc::clone(&log),
        );

        Ok(Server {
            config,
            listener,
            log,
            registry,
            coordinator,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[cfg(test)]
    pub fn termination(&self) -> TerminationFlag {
        self.coordinator.termination().clone()
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    #[cfg(test)]
    pub fn log(&self) -> Arc<SharedLog> {
        Arc::clone(&self.log)
    }

    /// Accept connections until `signal` resolves or the termination flag
    /// is raised, then run the shutdown sequence.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            log,
            registry,
            coordinator,
        } = self;
        let termination = coordinator.termination().clone();

        let started = listener.local_addr().map_err(Error::from).and_then(|address| {
            registry.spawn(
                WorkerKind::Timestamp,
                timestamp::run(
                    Arc::clone(&log),
                    termination.clone(),
                    config.timestamp_period(),
                ),
            )?;
            Ok(address)
        });
        let address = match started {
            Ok(address) => address,
            Err(e) => {
                error!(error = %e, "Server failed to start");
                drop(listener);
                coordinator.trigger();
                coordinator.complete().await;
                return Err(e);
            }
        };

        info!(
            address = %address,
            log_path = %log.path().display(),
            "Server listening"
        );

        tokio::pin!(signal);
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = termination.stopping() => break,
                _ = &mut signal => {
                    coordinator.trigger();
                    break;
                }
                _ = reap.tick() => {
                    if registry.reap_finished().await > 0 {
                        debug!(live = registry.len(), "Workers after reap");
                    }
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let worker = connection::serve(
                                stream,
                                peer,
                                Arc::clone(&log),
                                termination.clone(),
                                config.chunk_size,
                            );
                            match registry.spawn(WorkerKind::Connection { peer }, worker) {
                                Ok(id) => debug!(worker = id, peer = %peer, "Connection worker started"),
                                Err(e) => warn!(
                                    peer = %peer,
                                    capacity = registry.capacity(),
                                    error = %e,
                                    "Dropping connection"
                                ),
                            }
                            registry.reap_finished().await;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!("Listener closed, waiting for workers");
        coordinator.complete().await;
        Ok(())
    }
}
