//! Per-connection session: read, frame records, commit and replay.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    record::{LineAccumulator, Record},
    shutdown::ShutdownToken,
    store::LogStore,
};

/// Identity handed out by the acceptor, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Settings a worker needs from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub read_buffer_size: usize,
    pub max_record_len: usize,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side.
    PeerClosed,
    /// The registry closed the connection during shutdown.
    ForcedClose,
}

/// Runs one client session to completion and logs how it ended.
pub async fn run<S>(
    id: ConnectionId,
    peer: SocketAddr,
    stream: S,
    store: Arc<LogStore>,
    close: ShutdownToken,
    limits: WorkerLimits,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match serve(id, stream, &store, &close, limits).await {
        Ok(SessionEnd::PeerClosed) => info!(%id, %peer, "closed connection"),
        Ok(SessionEnd::ForcedClose) => info!(%id, %peer, "connection closed for shutdown"),
        Err(err) => error!(%id, %peer, error = %err, "connection ended with error"),
    }
}

/// Reads until EOF, error or forced close. Every completed record is
/// appended and followed by a replay of the whole log while the exclusive
/// section is still held.
pub async fn serve<S>(
    id: ConnectionId,
    mut stream: S,
    store: &LogStore,
    close: &ShutdownToken,
    limits: WorkerLimits,
) -> Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; limits.read_buffer_size];
    let mut lines = LineAccumulator::new(limits.max_record_len);

    let end = loop {
        let read = select! {
            biased;
            _ = close.triggered() => break SessionEnd::ForcedClose,
            read = stream.read(&mut buffer) => read,
        };

        let received = match read {
            Ok(0) => break SessionEnd::PeerClosed,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };

        let feed = lines.feed(&buffer[..received]);
        for overflow in &feed.overflows {
            error!(%id, error = %overflow, "line buffer overflow");
        }
        for record in &feed.records {
            commit_and_replay(id, record, store, &mut stream).await?;
        }
    };

    if let Some(overflow) = lines.unterminated_overflow() {
        error!(%id, error = %overflow, "line buffer overflow");
    }
    if lines.pending_len() > 0 {
        debug!(%id, bytes = lines.pending_len(), "discarding unterminated fragment");
    }
    if end == SessionEnd::ForcedClose {
        // Send FIN so the peer sees an orderly close rather than a reset.
        if let Err(err) = stream.shutdown().await {
            debug!(%id, error = %err, "half-close failed");
        }
    }
    Ok(end)
}

async fn commit_and_replay<W>(
    id: ConnectionId,
    record: &Record,
    store: &LogStore,
    destination: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = store.lock().await?;
    guard.append(record).await?;
    debug!(%id, bytes = record.len(), "appended record");

    match guard.replay_all(destination).await {
        Ok(sent) => {
            debug!(%id, bytes = sent, "replayed log");
            Ok(())
        }
        Err(err) => {
            warn!(%id, error = %err, "replay to client failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::error::Error;

    const LIMITS: WorkerLimits = WorkerLimits {
        read_buffer_size: 16,
        max_record_len: 32,
    };

    async fn store_in(dir: &TempDir) -> Arc<LogStore> {
        Arc::new(LogStore::create(dir.path().join("log")).await.unwrap())
    }

    async fn log_content(store: &LogStore) -> Vec<u8> {
        let mut out = Vec::new();
        store
            .lock()
            .await
            .unwrap()
            .replay_all(&mut out)
            .await
            .unwrap();
        out
    }

    async fn read_exactly(client: &mut tokio::io::DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(1), client.read_exact(&mut buf))
            .await
            .expect("replay should arrive")
            .expect("read replay");
        buf
    }

    #[tokio::test]
    async fn each_record_is_followed_by_a_full_replay() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let (mut client, server) = tokio::io::duplex(1024);
        let close = ShutdownToken::new();

        let session = {
            let store = Arc::clone(&store);
            let close = close.clone();
            tokio::spawn(async move { serve(ConnectionId(1), server, &store, &close, LIMITS).await })
        };

        client.write_all(b"one\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 4).await, b"one\n");

        client.write_all(b"two\nthr").await.unwrap();
        assert_eq!(read_exactly(&mut client, 8).await, b"one\ntwo\n");

        client.write_all(b"ee\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 14).await, b"one\ntwo\nthree\n");

        client.shutdown().await.unwrap();
        drop(client);
        let end = session.await.unwrap().expect("session");
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn fragment_without_newline_is_never_committed() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let (mut client, server) = tokio::io::duplex(1024);
        let close = ShutdownToken::new();

        client.write_all(b"no newline here").await.unwrap();
        drop(client);

        let end = serve(ConnectionId(2), server, &store, &close, LIMITS)
            .await
            .expect("session");
        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(log_content(&store).await.is_empty());
    }

    #[tokio::test]
    async fn close_handle_ends_a_blocked_read() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let (_client, server) = tokio::io::duplex(1024);
        let close = ShutdownToken::new();

        let session = {
            let store = Arc::clone(&store);
            let close = close.clone();
            tokio::spawn(async move { serve(ConnectionId(3), server, &store, &close, LIMITS).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_finished());
        close.trigger();

        let end = timeout(Duration::from_secs(1), session)
            .await
            .expect("worker should stop")
            .unwrap()
            .expect("session");
        assert_eq!(end, SessionEnd::ForcedClose);
    }

    #[tokio::test]
    async fn torn_down_store_ends_only_this_session() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store.teardown();
        let (mut client, server) = tokio::io::duplex(1024);
        let close = ShutdownToken::new();

        client.write_all(b"late\n").await.unwrap();
        let result = serve(ConnectionId(4), server, &store, &close, LIMITS).await;
        assert!(matches!(result, Err(Error::Lock)));
    }

    #[tokio::test]
    async fn overlong_record_is_stored_truncated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let (mut client, server) = tokio::io::duplex(4096);
        let close = ShutdownToken::new();

        let mut line = vec![b'x'; 40];
        line.push(b'\n');
        line.extend_from_slice(b"ok\n");
        client.write_all(&line).await.unwrap();
        client.shutdown().await.unwrap();

        serve(ConnectionId(5), server, &store, &close, LIMITS)
            .await
            .expect("session");

        let mut expected = vec![b'x'; 32];
        expected.push(b'\n');
        expected.extend_from_slice(b"ok\n");
        assert_eq!(log_content(&store).await, expected);
    }
}
