//! Connection handling for netplay
//!
//! A connection owns one transport split into an input and an output half,
//! runs the read loop on its own task and reports lifecycle events to a
//! [`ConnectionListener`].

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::protocol::CodecError;

/// Default capacity of the buffered input half
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection already started")]
    AlreadyStarted,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// How the read loop reacts to an error from [`ConnectionListener::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// Peer went away or the transport was released; close quietly
    Disconnected,
    /// Framing is lost; report and close
    Fatal,
    /// Report and keep reading
    Recoverable,
}

impl ConnectionError {
    /// Classify an error raised while reading
    pub fn read_failure(&self) -> ReadFailure {
        match self {
            ConnectionError::Closed => ReadFailure::Disconnected,
            ConnectionError::Io(e) | ConnectionError::Protocol(CodecError::Io(e)) => {
                if is_disconnect(e) {
                    ReadFailure::Disconnected
                } else {
                    ReadFailure::Fatal
                }
            }
            ConnectionError::Protocol(CodecError::NoHandlerRegistered(_))
            | ConnectionError::Protocol(CodecError::HandlerFailed { .. }) => {
                ReadFailure::Recoverable
            }
            _ => ReadFailure::Fatal,
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Buffered input half of a transport
pub type InputStream = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Output half of a transport
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives the events of a [`Connection`] and reads its messages
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Called once from the read loop before the first read
    async fn on_connected(&self, connection: &Connection);

    /// Called once when the connection closes, before the transport is released
    async fn on_disconnected(&self, connection: &Connection);

    /// Read and process exactly one unit of input
    async fn read(&self, input: &mut InputStream) -> ConnectionResult<()>;

    /// Called for read errors that do not end the connection, and for the
    /// fatal one that does
    async fn on_read_error(&self, connection: &Connection, error: &ConnectionError) {
        tracing::warn!("Read error on {}: {}", connection.peer(), error);
    }
}

/// One live transport
pub struct Connection {
    /// Human-readable description of the remote end
    peer: String,
    /// Taken by the read loop when started
    input: Mutex<Option<InputStream>>,
    /// Shared by every sender; one frame is written per lock
    output: AsyncMutex<OutputStream>,
    listener: Mutex<Option<Weak<dyn ConnectionListener>>>,
    /// Set once by the first `close()`
    closed: AtomicBool,
    /// Stops the read loop
    shutdown: watch::Sender<bool>,
    /// Aborts pending writes; set once the listener has been notified
    release: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an already opened transport
    pub fn new<T>(transport: T, peer: impl Into<String>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_read_buffer(transport, peer, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Wrap a transport with an explicit input buffer size
    pub fn with_read_buffer<T>(transport: T, peer: impl Into<String>, capacity: usize) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let input: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let (shutdown, _) = watch::channel(false);
        let (release, _) = watch::channel(false);

        Arc::new(Self {
            peer: peer.into(),
            input: Mutex::new(Some(BufReader::with_capacity(capacity, input))),
            output: AsyncMutex::new(Box::new(write_half)),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown,
            release,
        })
    }

    /// Description of the remote end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Check whether `close()` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the listener notified by `close()`
    ///
    /// Only a weak reference is kept, so a listener owning this connection
    /// does not form a cycle.
    pub fn set_listener(&self, listener: Weak<dyn ConnectionListener>) {
        *lock(&self.listener) = Some(listener);
    }

    /// Spawn the read loop
    ///
    /// `listener` replaces any listener set before; the loop holds it
    /// strongly until it exits.
    pub fn start(
        self: &Arc<Self>,
        listener: Arc<dyn ConnectionListener>,
    ) -> ConnectionResult<JoinHandle<()>> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let input = lock(&self.input)
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;
        self.set_listener(Arc::downgrade(&listener));

        let connection = self.clone();
        Ok(tokio::spawn(async move {
            connection.run(listener, input).await;
        }))
    }

    async fn run(self: Arc<Self>, listener: Arc<dyn ConnectionListener>, mut input: InputStream) {
        let mut shutdown_rx = self.shutdown.subscribe();
        // close() may have won the race against start()
        if !*shutdown_rx.borrow_and_update() {
            listener.on_connected(&self).await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    result = listener.read(&mut input) => {
                        let Err(e) = result else { continue };
                        match e.read_failure() {
                            ReadFailure::Disconnected => {
                                tracing::debug!("Connection to {} ended: {}", self.peer, e);
                                break;
                            }
                            ReadFailure::Fatal => {
                                listener.on_read_error(&self, &e).await;
                                break;
                            }
                            ReadFailure::Recoverable => {
                                listener.on_read_error(&self, &e).await;
                            }
                        }
                    }
                }
            }
        }

        self.close().await;
    }

    /// Write one complete frame and flush it
    ///
    /// A write still waiting for the lock or for the peer when the transport
    /// is released fails with [`ConnectionError::Closed`].
    pub async fn write_frame(&self, frame: &[u8]) -> ConnectionResult<()> {
        let mut release_rx = self.release.subscribe();
        if *release_rx.borrow_and_update() {
            return Err(ConnectionError::Closed);
        }

        tokio::select! {
            biased;
            _ = release_rx.changed() => Err(ConnectionError::Closed),
            result = async {
                let mut output = self.output.lock().await;
                output.write_all(frame).await?;
                output.flush().await?;
                Ok::<(), ConnectionError>(())
            } => result,
        }
    }

    /// Close the connection
    ///
    /// Only the first call has an effect: it stops the read loop, notifies
    /// the listener and releases the transport. Writes blocked on a peer that
    /// stopped reading are aborted, so this never waits on them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop dispatching before observers see the disconnect
        self.shutdown.send_replace(true);

        let listener = lock(&self.listener).take().and_then(|weak| weak.upgrade());
        if let Some(listener) = listener {
            listener.on_disconnected(self).await;
        }

        self.release.send_replace(true);

        let mut output = self.output.lock().await;
        if let Err(e) = output.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
        // The input half is dropped by the read loop (or here, if never started)
        drop(lock(&self.input).take());

        tracing::debug!("Connection to {} closed", self.peer);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        errors: AtomicUsize,
        /// Disconnects observed after the read loop was told to stop
        stopped_first: AtomicUsize,
        bytes: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl ConnectionListener for Recorder {
        async fn on_connected(&self, _connection: &Connection) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_disconnected(&self, connection: &Connection) {
            if *connection.shutdown.borrow() {
                self.stopped_first.fetch_add(1, Ordering::SeqCst);
            }
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        async fn read(&self, input: &mut InputStream) -> ConnectionResult<()> {
            let byte = input.read_u8().await?;
            if byte == 0xEE {
                return Err(ConnectionError::Protocol(CodecError::NoHandlerRegistered(0)));
            }
            lock(&self.bytes).push(byte);
            Ok(())
        }

        async fn on_read_error(&self, _connection: &Connection, _error: &ConnectionError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_read_loop_until_eof() {
        let (local, mut remote) = tokio::io::duplex(64);
        let connection = Connection::new(local, "test");
        let recorder = Arc::new(Recorder::default());
        let handle = connection.start(recorder.clone()).unwrap();

        remote.write_all(&[1, 0xEE, 2, 3]).await.unwrap();
        drop(remote);
        handle.await.unwrap();

        assert_eq!(*lock(&recorder.bytes), vec![1, 2, 3]);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_loop() {
        let (local, _remote) = tokio::io::duplex(64);
        let connection = Connection::new(local, "test");
        let recorder = Arc::new(Recorder::default());
        let handle = connection.start(recorder.clone()).unwrap();

        // Nothing ever arrives; close must unblock the pending read
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.close().await;
        connection.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("read loop should exit after close")
            .unwrap();

        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.stopped_first.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_write() {
        // The remote end never reads, so the writer fills the pipe and blocks
        let (local, _remote) = tokio::io::duplex(16);
        let connection = Connection::new(local, "test");

        let writer = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.write_frame(&[0u8; 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(2), connection.close())
            .await
            .expect("close should not wait for a stalled writer");

        let result = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("stalled write should be aborted")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (local, mut remote) = tokio::io::duplex(64);
        let connection = Connection::new(local, "test");

        connection.write_frame(&[9, 8, 7]).await.unwrap();
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [9, 8, 7]);

        connection.close().await;
        assert!(matches!(
            connection.write_frame(&[1]).await,
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            connection.start(Arc::new(Recorder::default())),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (local, _remote) = tokio::io::duplex(64);
        let connection = Connection::new(local, "test");
        let recorder = Arc::new(Recorder::default());
        let _handle = connection.start(recorder.clone()).unwrap();
        assert!(matches!(
            connection.start(recorder),
            Err(ConnectionError::AlreadyStarted)
        ));
        connection.close().await;
    }

    #[test]
    fn test_read_failure_classification() {
        let eof = ConnectionError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(eof.read_failure(), ReadFailure::Disconnected);

        let unknown = ConnectionError::Protocol(CodecError::UnknownMessageType(4));
        assert_eq!(unknown.read_failure(), ReadFailure::Fatal);

        let garbage = ConnectionError::Protocol(CodecError::Io(io::Error::from(
            io::ErrorKind::InvalidData,
        )));
        assert_eq!(garbage.read_failure(), ReadFailure::Fatal);

        let unhandled = ConnectionError::Protocol(CodecError::NoHandlerRegistered(4));
        assert_eq!(unhandled.read_failure(), ReadFailure::Recoverable);
    }
}
