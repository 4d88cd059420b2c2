use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{DeviceId, TransportError};

/// Default buffer size for in-memory pipes (64 KiB).
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for one connection, used as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A duplex byte stream to one remote identity.
///
/// Cheap to clone; all clones share the stream. Reads and writes are each
/// serialized by their own lock, so one reader task and one writer task can
/// work concurrently. The first call to [`disconnect`](Connection::disconnect)
/// fires the close signal exactly once; every later read or write fails with
/// [`TransportError::Closed`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    remote: DeviceId,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
    disconnecting: AtomicBool,
    io_timeout: Option<Duration>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap separate read and write halves.
    pub fn new<R, W>(remote: DeviceId, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                remote,
                reader: Mutex::new(Box::new(reader)),
                writer: Mutex::new(Box::new(writer)),
                closed: CancellationToken::new(),
                disconnecting: AtomicBool::new(false),
                io_timeout: None,
            }),
        }
    }

    /// Wrap a single duplex stream (e.g. a `TcpStream`).
    pub fn from_stream<S>(remote: DeviceId, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(remote, reader, writer)
    }

    /// Bound every write on this connection.
    pub fn with_io_timeout(self, timeout: Option<Duration>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.io_timeout = timeout;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Two connected in-memory endpoints: the first lives at `a` and talks
    /// to `b`, the second the other way round.
    pub fn pipe(a: DeviceId, b: DeviceId, capacity: usize) -> (Connection, Connection) {
        let (left, right) = tokio::io::duplex(capacity);
        (Self::from_stream(b, left), Self::from_stream(a, right))
    }

    /// A connection to `local` itself: every byte written is read back.
    pub fn loopback(local: DeviceId, capacity: usize) -> Connection {
        let (write_end, read_end) = tokio::io::duplex(capacity);
        Self::new(local, read_end, write_end)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Identity of the device at the other end.
    pub fn remote(&self) -> &DeviceId {
        &self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, locally or by the peer.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// A token that is cancelled when this connection closes.
    ///
    /// Cancelling the returned token does not close the connection.
    pub fn close_signal(&self) -> CancellationToken {
        self.inner.closed.child_token()
    }

    /// Fill `buf` completely.
    ///
    /// Fails with `Closed` if the connection closes while waiting and with
    /// `Eof` when the peer shut its side down.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(TransportError::Closed),
            guard = self.inner.reader.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(TransportError::Closed),
            res = reader.read_exact(buf) => match res {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Eof),
                Err(e) => Err(TransportError::Io(e)),
            },
        }
    }

    /// Like [`read_exact`](Connection::read_exact) but bounded.
    ///
    /// Bytes consumed before the timeout fires are lost, so only use this
    /// where the stream is abandoned on failure (handshakes).
    pub async fn read_exact_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        tokio::time::timeout(timeout, self.read_exact(buf))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    /// Write all of `data` and flush.
    ///
    /// A write that fails or times out after some of `data` went out leaves
    /// the stream mid-frame. The connection is then closed and the call
    /// returns `Closed`; retrying is only safe on errors that report
    /// `is_disconnect() == false`.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        let res = match self.inner.io_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.write_inner(data, &mut written))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout))),
            None => self.write_inner(data, &mut written).await,
        };
        match res {
            Err(e) if written > 0 && !e.is_disconnect() => {
                tracing::warn!(
                    connection = %self.inner.id,
                    remote = %self.inner.remote,
                    written,
                    len = data.len(),
                    "torn write, closing: {e}"
                );
                self.disconnect();
                Err(TransportError::Closed)
            }
            other => other,
        }
    }

    async fn write_inner(&self, data: &[u8], written: &mut usize) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(TransportError::Closed),
            guard = self.inner.writer.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(TransportError::Closed),
            res = async {
                while *written < data.len() {
                    match writer.write(&data[*written..]).await? {
                        0 => return Err(std::io::ErrorKind::WriteZero.into()),
                        n => *written += n,
                    }
                }
                writer.flush().await
            } => res.map_err(|e| match e.kind() {
                std::io::ErrorKind::BrokenPipe => TransportError::Eof,
                _ => TransportError::Io(e),
            }),
        }
    }

    /// Close the connection. Idempotent; returns `true` for the call that
    /// actually closed it.
    ///
    /// The write side is shut down in the background so the peer observes
    /// end-of-stream.
    pub fn disconnect(&self) -> bool {
        if self.inner.disconnecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.closed.cancel();
        tracing::debug!(connection = %self.inner.id, remote = %self.inner.remote, "connection closed");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                let mut writer = inner.writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn pipe_carries_bytes_both_ways() {
        let (at_a, at_b) = Connection::pipe(id("a"), id("b"), 1024);
        assert_eq!(at_a.remote(), &id("b"));
        assert_eq!(at_b.remote(), &id("a"));

        at_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        at_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        at_b.write_all(b"pong").await.unwrap();
        at_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn loopback_reads_its_own_writes() {
        let conn = Connection::loopback(id("self"), 1024);
        assert_eq!(conn.remote(), &id("self"));
        conn.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_peer_sees_eof() {
        let (at_a, at_b) = Connection::pipe(id("a"), id("b"), 1024);
        assert!(at_a.disconnect());
        assert!(!at_a.disconnect());
        assert!(at_a.is_closed());

        let mut buf = [0u8; 1];
        let err = at_b.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::Eof), "got {err:?}");
        assert!(matches!(
            at_a.write_all(b"x").await.unwrap_err(),
            TransportError::Closed
        ));
    }

    #[tokio::test]
    async fn disconnect_wakes_a_blocked_reader() {
        let (at_a, _at_b) = Connection::pipe(id("a"), id("b"), 1024);
        let reader = at_a.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf).await
        });
        tokio::task::yield_now().await;
        at_a.disconnect();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(TransportError::Closed)));
        at_a.closed().await;
    }

    #[tokio::test]
    async fn timed_out_partial_write_closes_the_connection() {
        let (at_a, at_b) = Connection::pipe(id("a"), id("b"), 16);
        let at_a = at_a.with_io_timeout(Some(Duration::from_millis(30)));

        let err = at_a.write_all(&[7u8; 200]).await.unwrap_err();
        assert!(err.is_disconnect(), "got {err:?}");
        assert!(at_a.is_closed());

        // The peer gets the torn prefix and then end-of-stream, never a
        // second copy of the frame.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut buf = [0u8; 16];
        at_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 16]);
        let mut more = [0u8; 1];
        assert!(matches!(
            at_b.read_exact(&mut more).await.unwrap_err(),
            TransportError::Eof
        ));
    }

    #[tokio::test]
    async fn timeout_before_any_byte_is_retryable() {
        let (at_a, at_b) = Connection::pipe(id("a"), id("b"), 4);
        let at_a = at_a.with_io_timeout(Some(Duration::from_millis(30)));
        at_a.write_all(b"full").await.unwrap();

        let err = at_a.write_all(b"more").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
        assert!(!at_a.is_closed());

        let mut buf = [0u8; 4];
        at_b.read_exact(&mut buf).await.unwrap();
        at_a.write_all(b"more").await.unwrap();
        at_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let (a, b) = Connection::pipe(id("a"), id("b"), 16);
        let c = Connection::loopback(id("c"), 16);
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    #[tokio::test]
    async fn close_signal_child_does_not_close_connection() {
        let (a, _b) = Connection::pipe(id("a"), id("b"), 16);
        let signal = a.close_signal();
        signal.cancel();
        assert!(!a.is_closed());

        let signal = a.close_signal();
        a.disconnect();
        assert!(signal.is_cancelled());
    }
}
