//! Termination state and the shutdown sequence.
//!
//! A [`TerminationFlag`] is cloned into every worker at spawn time. Workers
//! check it at their loop boundaries and wait on [`TerminationFlag::stopping`]
//! while idle; nothing is interrupted in the middle of an append or replay.

use crate::error::{Error, Result};
use crate::registry::WorkerRegistry;
use crate::shared_log::SharedLog;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Process-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopping,
    Stopped,
}

/// Cooperative cancellation shared by the listener and all workers.
#[derive(Debug, Clone)]
pub struct TerminationFlag {
    state: Arc<watch::Sender<RunState>>,
}

impl TerminationFlag {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Move from `Running` to `Stopping`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn begin_stopping(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopping;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_stopped(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    /// Resolves once the state has left `Running`.
    pub async fn stopping(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state != RunState::Running).await;
    }
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the stop sequence: stop accepting, join workers, release the log.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    termination: TerminationFlag,
    registry: Arc<WorkerRegistry>,
    log: Arc<SharedLog>,
}

impl ShutdownCoordinator {
    pub fn new(
        termination: TerminationFlag,
        registry: Arc<WorkerRegistry>,
        log: Arc<SharedLog>,
    ) -> Self {
        Self {
            termination,
            registry,
            log,
        }
    }

    pub fn termination(&self) -> &TerminationFlag {
        &self.termination
    }

    /// Signal every loop to stop. New work is refused from here on.
    pub fn trigger(&self) -> bool {
        let first = self.termination.begin_stopping();
        if first {
            info!("Shutdown requested");
        }
        first
    }

    /// Join all workers, close and delete the log, then mark `Stopped`.
    ///
    /// The listening socket must already be closed. Safe to call more than
    /// once: an empty registry drains immediately and a missing log file is
    /// not an error.
    pub async fn complete(&self) {
        let joined = self.registry.drain_and_join_all().await;
        debug!(joined, "All workers joined");

        if let Err(e) = self.log.close().await {
            warn!(error = %e, "Failed to flush log before removal");
        }
        if let Err(e) = self.log.remove().await {
            warn!(error = %e, "Shutdown cleanup failed");
        }

        self.termination.mark_stopped();
        info!("Shutdown complete");
    }

    /// `trigger` followed by `complete`.
    #[cfg(test)]
    pub async fn shutdown(&self) {
        self.trigger();
        self.complete().await;
    }
}

/// Install SIGINT and SIGTERM handlers.
///
/// The returned future resolves on whichever signal arrives first. Must be
/// called from within the tokio runtime.
pub fn termination_signal() -> Result<impl Future<Output = ()> + Send> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::setup("installing SIGTERM handler", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::setup("installing SIGINT handler", e))?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "Caught signal, exiting"),
            _ = sigint.recv() => info!(signal = "SIGINT", "Caught signal, exiting"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_flag_transitions_once() {
        let flag = TerminationFlag::new();
        assert!(flag.is_running());

        assert!(flag.begin_stopping());
        assert!(!flag.begin_stopping());
        assert_eq!(flag.state(), RunState::Stopping);

        flag.mark_stopped();
        assert_eq!(flag.state(), RunState::Stopped);
        assert!(!flag.begin_stopping());
        assert_eq!(flag.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_stopping_wakes_waiters() {
        let flag = TerminationFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopping().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flag.begin_stopping();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();

        // Already stopping: resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), flag.stopping())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::create(dir.path().join("log")).await.unwrap();
        let registry = Arc::new(WorkerRegistry::new(4));
        let flag = TerminationFlag::new();

        let worker_flag = flag.clone();
        registry
            .spawn(crate::registry::WorkerKind::Timestamp, async move {
                worker_flag.stopping().await;
            })
            .unwrap();

        let coordinator = ShutdownCoordinator::new(flag.clone(), Arc::clone(&registry), Arc::clone(&log));
        log.append(b"data\n").await.unwrap();

        coordinator.shutdown().await;
        assert!(registry.is_empty());
        assert!(!log.path().exists());
        assert_eq!(flag.state(), RunState::Stopped);

        // Second run finds nothing to join and nothing to delete.
        coordinator.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(flag.state(), RunState::Stopped);
    }
}
