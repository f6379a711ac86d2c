//! Per-connection worker.
//!
//! Each accepted connection gets one task running [`handle_connection`]:
//! read a chunk, append it to the shared log, and when the chunk contains a
//! newline, replay the whole log back to the client in the same critical
//! section as the append.

use crate::error::Result;
use crate::shared_log::SharedLog;
use crate::shutdown::TerminationFlag;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, trace};

/// Packet terminator.
pub const BOUNDARY: u8 = b'\n';

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next chunk from the peer.
    Reading,
    /// Streaming the log back after a packet boundary.
    Replaying,
    /// Peer closed, an I/O error occurred, or the service is stopping.
    Closed,
}

/// Counters reported when a connection closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub packets: u64,
    pub bytes_replayed: u64,
}

/// Whether `chunk` completes a packet.
///
/// Only the chunk just read is scanned; bytes buffered by earlier reads are
/// already in the log.
pub fn contains_boundary(chunk: &[u8]) -> bool {
    chunk.contains(&BOUNDARY)
}

/// Serve one client until it disconnects or the service stops.
///
/// Generic over the stream so tests can drive it with an in-memory mock.
pub async fn handle_connection<S>(
    stream: &mut S,
    log: &SharedLog,
    termination: &TerminationFlag,
    chunk_size: usize,
) -> Result<ConnectionStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(chunk_size);
    let mut stats = ConnectionStats::default();
    let mut state = ConnState::Reading;

    while state != ConnState::Closed {
        if !termination.is_running() {
            break;
        }

        buffer.clear();
        let n = tokio::select! {
            biased;
            _ = termination.stopping() => 0,
            result = stream.read_buf(&mut buffer) => result?,
        };
        if n == 0 {
            state = ConnState::Closed;
            continue;
        }
        stats.bytes_received += n as u64;

        if !contains_boundary(&buffer) {
            log.append(&buffer).await?;
            trace!(len = n, "Partial packet appended");
            continue;
        }

        state = ConnState::Replaying;
        {
            let mut guard = log.lock().await;
            guard.append(&buffer).await?;
            trace!(?state, len = n, "Packet complete");
            stats.bytes_replayed += guard.replay_to(&mut *stream).await?;
        }
        stats.packets += 1;
        state = ConnState::Reading;
    }

    Ok(stats)
}

/// Task body for an accepted TCP connection.
///
/// Errors end only this connection; they are logged and never propagate.
pub async fn serve<S>(
    mut stream: S,
    peer: SocketAddr,
    log: Arc<SharedLog>,
    termination: TerminationFlag,
    chunk_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(peer = %peer.ip(), "Accepted connection from {}", peer.ip());

    match handle_connection(&mut stream, &log, &termination, chunk_size).await {
        Ok(stats) => debug!(
            peer = %peer,
            bytes_received = stats.bytes_received,
            packets = stats.packets,
            bytes_replayed = stats.bytes_replayed,
            "Connection finished"
        ),
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }

    info!(peer = %peer.ip(), "Closed connection from {}", peer.ip());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tokio_test::io::Builder;

    const CHUNK: usize = 1024;

    async fn new_log(dir: &tempfile::TempDir) -> Arc<SharedLog> {
        SharedLog::create(dir.path().join("log")).await.unwrap()
    }

    async fn contents(log: &SharedLog) -> Vec<u8> {
        let mut out = Vec::new();
        log.replay_to(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_contains_boundary() {
        assert!(contains_boundary(b"hello\n"));
        assert!(contains_boundary(b"\nrest"));
        assert!(!contains_boundary(b"partial"));
        assert!(!contains_boundary(b""));
    }

    #[tokio::test]
    async fn test_single_packet_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        let mut stream = Builder::new().read(b"hello\n").write(b"hello\n").build();
        let stats = handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap();

        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes_replayed, 6);
        assert_eq!(contents(&log).await, b"hello\n");
    }

    #[tokio::test]
    async fn test_partial_packets_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        let mut stream = Builder::new()
            .read(b"ab")
            .read(b"c\n")
            .write(b"abc\n")
            .build();
        handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap();

        assert_eq!(contents(&log).await, b"abc\n");
    }

    #[tokio::test]
    async fn test_replay_includes_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();
        log.append(b"timestamp:earlier\n").await.unwrap();

        let mut stream = Builder::new()
            .read(b"one\n")
            .write(b"timestamp:earlier\none\n")
            .read(b"two\n")
            .write(b"timestamp:earlier\none\ntwo\n")
            .build();
        let stats = handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap();
        assert_eq!(stats.packets, 2);
    }

    #[tokio::test]
    async fn test_bytes_after_boundary_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        // The whole chunk is appended before the replay, trailing bytes included.
        let mut stream = Builder::new().read(b"x\ny").write(b"x\ny").build();
        handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap();
        assert_eq!(contents(&log).await, b"x\ny");
    }

    #[tokio::test]
    async fn test_boundary_only_seen_in_its_own_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        // With 4-byte chunks the newline lands in the second read.
        let mut stream = Builder::new()
            .read(b"abcdef\n")
            .write(b"abcdef\n")
            .build();
        let stats = handle_connection(&mut stream, &log, &flag, 4).await.unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes_received, 7);
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        let mut stream = Builder::new()
            .read(b"kept")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let err = handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(contents(&log).await, b"kept");
    }

    #[tokio::test]
    async fn test_write_error_during_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        let mut stream = Builder::new()
            .read(b"lost reply\n")
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let err = handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        // The append still happened and the log is usable by others.
        log.append(b"next\n").await.unwrap();
        assert_eq!(contents(&log).await, b"lost reply\nnext\n");
    }

    #[tokio::test]
    async fn test_exits_when_already_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();
        flag.begin_stopping();

        let mut stream = Builder::new().build();
        let stats = handle_connection(&mut stream, &log, &flag, CHUNK)
            .await
            .unwrap();
        assert_eq!(stats, ConnectionStats::default());
    }

    #[tokio::test]
    async fn test_idle_reader_exits_on_termination() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(&dir).await;
        let flag = TerminationFlag::new();

        let (client, mut server) = tokio::io::duplex(64);
        let task = {
            let log = Arc::clone(&log);
            let flag = flag.clone();
            tokio::spawn(async move { handle_connection(&mut server, &log, &flag, CHUNK).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        flag.begin_stopping();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker ignored termination")
            .unwrap()
            .unwrap();
        assert_eq!(stats.packets, 0);
        drop(client);
    }
}
