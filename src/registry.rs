//! Registry of live workers.
//!
//! Every spawned task (connection workers and the timestamp writer) is
//! recorded here so the shutdown sequence can join all of them. The slab is
//! guarded by a plain mutex that is only held for the duration of a
//! mutation, never across a join.

use crate::error::{Error, Result};
use slab::Slab;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// What a registered worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Serves one accepted client connection.
    Connection { peer: SocketAddr },
    /// The periodic timestamp writer.
    Timestamp,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Connection { peer } => write!(f, "connection {peer}"),
            WorkerKind::Timestamp => f.write_str("timestamp writer"),
        }
    }
}

/// One spawned unit of execution.
#[derive(Debug)]
pub struct WorkerRecord {
    id: usize,
    kind: WorkerKind,
    handle: JoinHandle<()>,
}

impl WorkerRecord {
    #[cfg(test)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Completion indicator; a finished worker joins without blocking.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker to exit, logging a panic instead of propagating it.
    pub async fn join(self) {
        match self.handle.await {
            Ok(()) => trace!(worker = self.id, kind = %self.kind, "Worker joined"),
            Err(e) if e.is_panic() => {
                error!(worker = self.id, kind = %self.kind, "Worker panicked")
            }
            Err(e) => debug!(worker = self.id, kind = %self.kind, error = %e, "Worker cancelled"),
        }
    }
}

/// Mutation-safe collection of [`WorkerRecord`]s.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Mutex<Slab<WorkerRecord>>,
    max_workers: usize,
}

impl WorkerRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_workers: usize) -> Self {
        Self {
            workers: Mutex::new(Slab::with_capacity(max_workers.min(64))),
            max_workers,
        }
    }

    fn workers(&self) -> MutexGuard<'_, Slab<WorkerRecord>> {
        // A panic while holding this lock cannot leave the slab half-mutated.
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `task` and record it.
    ///
    /// Spawning and insertion happen under the registry lock, so a
    /// concurrent drain can never miss a worker that has started. When the
    /// registry is at capacity nothing is spawned and `task` is dropped,
    /// along with any connection it owns.
    pub fn spawn<F>(&self, kind: WorkerKind, task: F) -> Result<usize>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers();
        if workers.len() >= self.max_workers {
            return Err(Error::RegistryFull(workers.len()));
        }

        let entry = workers.vacant_entry();
        let id = entry.key();
        let handle = tokio::spawn(task);
        entry.insert(WorkerRecord { id, kind, handle });
        trace!(worker = id, %kind, "Worker registered");
        Ok(id)
    }

    /// Remove a record without joining it.
    pub fn remove(&self, id: usize) -> Option<WorkerRecord> {
        self.workers().try_remove(id)
    }

    /// Join every worker that has already finished.
    ///
    /// Called from the accept loop, the only place workers are added, so a
    /// finished id is not reused before it is removed. Returns the number of
    /// records reaped.
    pub async fn reap_finished(&self) -> usize {
        let ids: Vec<usize> = self
            .workers()
            .iter()
            .filter(|(_, record)| record.is_finished())
            .map(|(id, _)| id)
            .collect();
        let finished: Vec<WorkerRecord> = ids.into_iter().filter_map(|id| self.remove(id)).collect();

        let count = finished.len();
        for record in finished {
            record.join().await;
        }
        if count > 0 {
            debug!(count, "Reaped finished workers");
        }
        count
    }

    /// Remove and join workers one at a time until the registry is empty.
    ///
    /// Records leave the registry only through [`remove`], which holds the
    /// lock for the removal alone. Every join happens after it is released,
    /// so a slow worker never blocks `spawn` or `len`.
    ///
    /// [`remove`]: WorkerRegistry::remove
    pub async fn drain_and_join_all(&self) -> usize {
        let mut joined = 0;
        loop {
            let next = self.workers().iter().next().map(|(id, _)| id);
            let Some(id) = next else {
                break;
            };
            // Already taken by a concurrent reap: pick again.
            if let Some(record) = self.remove(id) {
                record.join().await;
                joined += 1;
            }
        }
        joined
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.workers().is_empty()
    }

    /// Maximum number of workers allowed.
    pub fn capacity(&self) -> usize {
        self.max_workers
    }
}
