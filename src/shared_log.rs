//! The shared append-only log.
//!
//! One file, one lock. Every append and every replay runs while holding the
//! lock, so byte ranges written by different workers never interleave and a
//! replay always observes a prefix of the global append order.
//!
//! Positioning (rewind for a replay, seek back to the end afterwards) is
//! only reachable through [`LogGuard`], which can only be obtained by taking
//! the lock.

use crate::error::{Error, Result};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

/// Bytes copied per read during a replay.
const REPLAY_CHUNK_SIZE: usize = 4 * 1024;

/// Handle to the persisted log, shared by every worker.
#[derive(Debug)]
pub struct SharedLog {
    path: PathBuf,
    /// `None` once the shutdown sequence has closed the file.
    file: Mutex<Option<File>>,
}

impl SharedLog {
    /// Create (or truncate) the log file at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| Error::setup(format!("opening log file '{}'", path.display()), e))?;

        info!(path = %path.display(), "Log file opened");
        Ok(Arc::new(Self {
            path,
            file: Mutex::new(Some(file)),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the log lock.
    ///
    /// Use this when several operations must form one critical section,
    /// e.g. an append immediately followed by a replay.
    pub async fn lock(&self) -> LogGuard<'_> {
        LogGuard {
            file: self.file.lock().await,
        }
    }

    /// Append `bytes` at the end of the log under the lock.
    pub async fn append(&self, bytes: &[u8]) -> Result<usize> {
        self.lock().await.append(bytes).await
    }

    /// Stream the whole log into `sink` under the lock.
    #[cfg(test)]
    pub async fn replay_to<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.lock().await.replay_to(sink).await
    }

    /// Flush and close the file. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            debug!(path = %self.path.display(), "Log file closed");
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }

    /// Delete the persisted log.
    ///
    /// Returns `false` when the file was already gone.
    pub async fn remove(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Log file removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(Error::Cleanup {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Exclusive access to the log for the lifetime of the guard.
pub struct LogGuard<'a> {
    file: MutexGuard<'a, Option<File>>,
}

impl LogGuard<'_> {
    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::LogClosed)
    }

    /// Write `bytes` at end-of-file.
    ///
    /// A short write surfaces as `WriteZero` from `write_all` and fails the
    /// whole append.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        let file = self.file()?;
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        trace!(len = bytes.len(), "Appended to log");
        Ok(bytes.len())
    }

    /// Copy the log from offset 0 into `sink`, then reposition at the end.
    pub async fn replay_to<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let file = self.file()?;
        file.seek(SeekFrom::Start(0)).await?;
        let copied = copy_to_sink(file, sink).await;
        // Restore the append position even when the sink failed.
        file.seek(SeekFrom::End(0)).await?;
        let copied = copied?;
        trace!(bytes = copied, "Replayed log");
        Ok(copied)
    }
}

async fn copy_to_sink<W>(file: &mut File, sink: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut chunk = vec![0u8; REPLAY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&chunk[..n]).await?;
        total += n as u64;
    }
    sink.flush().await?;
    Ok(total)
}
