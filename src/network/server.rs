//! netplay Server
//!
//! The server accepts transports from an [`Acceptor`], wraps each one in a
//! [`Connector`], keeps track of the live ones and broadcasts to them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::ConnectionError;
use super::connector::{
    Connector, ConnectorConfig, ConnectorListener, DefaultClientConnectorListener, Registry,
};
use crate::protocol::Message;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server terminated")]
    Terminated,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(io::Error),

    #[error("Send to {peer} failed: {error}")]
    SendFailed {
        peer: String,
        error: ConnectionError,
    },
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Source of incoming transports
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next transport and describe its remote end
    async fn accept(&mut self) -> io::Result<(Self::Transport, String)>;

    /// Description of the listening endpoint
    fn local_description(&self) -> String;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Transport = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }

    fn local_description(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string())
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for tokio::net::UnixListener {
    type Transport = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<(tokio::net::UnixStream, String)> {
        let (stream, addr) = tokio::net::UnixListener::accept(self).await?;
        let peer = addr
            .as_pathname()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unix:unnamed".to_string());
        Ok((stream, peer))
    }

    fn local_description(&self) -> String {
        self.local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string()))
            .unwrap_or_else(|| "unix".to_string())
    }
}

/// Observer of the server lifecycle; the defaults log
#[async_trait]
pub trait ServerStateListener: Send + Sync {
    async fn on_started(&self) {
        tracing::info!("Server started");
    }

    async fn on_terminated(&self) {
        tracing::info!("Server terminated");
    }

    async fn on_exception(&self, error: &ServerError) {
        tracing::error!("Server error: {}", error);
    }
}

/// Server state listener that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultServerStateListener;

impl ServerStateListener for DefaultServerStateListener {}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

type ConnectorSet = Mutex<HashMap<Uuid, Arc<Connector>>>;

/// Removes a connector from the server's set once it disconnects
struct Tracker {
    connectors: Weak<ConnectorSet>,
}

#[async_trait]
impl ConnectorListener for Tracker {
    async fn on_disconnected(&self, connector: &Arc<Connector>) {
        if let Some(connectors) = self.connectors.upgrade() {
            lock(&connectors).remove(&connector.id());
        }
    }
}

/// netplay Server
pub struct Server<A: Acceptor> {
    /// Taken by the accept loop, dropped when it exits
    acceptor: Mutex<Option<A>>,
    local_description: String,
    registry: Arc<Registry>,
    connector_config: ConnectorConfig,
    client_listener: Arc<dyn ConnectorListener>,
    state_listener: Arc<dyn ServerStateListener>,
    state: AtomicU8,
    connectors: Arc<ConnectorSet>,
    shutdown: watch::Sender<bool>,
}

impl<A: Acceptor> Server<A> {
    /// Create a server with the logging listeners
    pub fn new(acceptor: A, registry: Arc<Registry>) -> Arc<Self> {
        Self::with_listeners(
            acceptor,
            registry,
            Arc::new(DefaultClientConnectorListener),
            Arc::new(DefaultServerStateListener),
            ConnectorConfig::default(),
        )
    }

    /// Create a server
    ///
    /// `client_listener` is attached to every accepted connector.
    pub fn with_listeners(
        acceptor: A,
        registry: Arc<Registry>,
        client_listener: Arc<dyn ConnectorListener>,
        state_listener: Arc<dyn ServerStateListener>,
        connector_config: ConnectorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            local_description: acceptor.local_description(),
            acceptor: Mutex::new(Some(acceptor)),
            registry,
            connector_config,
            client_listener,
            state_listener,
            state: AtomicU8::new(CREATED),
            connectors: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        })
    }

    /// Check if the server is accepting connections
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Check if the server has been closed
    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    /// Description of the listening endpoint
    pub fn local_description(&self) -> &str {
        &self.local_description
    }

    /// Number of tracked connectors
    pub fn connector_count(&self) -> usize {
        lock(&self.connectors).len()
    }

    /// Snapshot of the tracked connectors
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        lock(&self.connectors).values().cloned().collect()
    }

    /// Start the accept loop
    pub fn start(self: &Arc<Self>) -> ServerResult<JoinHandle<()>> {
        if let Err(state) =
            self.state
                .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            return Err(if state == RUNNING {
                ServerError::AlreadyRunning
            } else {
                ServerError::Terminated
            });
        }

        let acceptor = lock(&self.acceptor).take().ok_or(ServerError::Terminated)?;
        let server = self.clone();
        Ok(tokio::spawn(async move {
            server.run(acceptor).await;
        }))
    }

    async fn run(self: Arc<Self>, mut acceptor: A) {
        let mut shutdown_rx = self.shutdown.subscribe();
        // close() may have won the race against start()
        if !*shutdown_rx.borrow_and_update() {
            self.state_listener.on_started().await;
            tracing::info!("Server listening on {}", self.local_description);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    result = acceptor.accept() => match result {
                        Ok((transport, peer)) => self.admit(transport, peer).await,
                        Err(e) => {
                            // A listener closed during shutdown is not an error
                            if !self.is_terminated() {
                                self.state_listener
                                    .on_exception(&ServerError::AcceptFailed(e))
                                    .await;
                            }
                            break;
                        }
                    }
                }
            }
        }

        drop(acceptor);
        self.close().await;
    }

    async fn admit(&self, transport: A::Transport, peer: String) {
        tracing::info!("New connection from {}", peer);

        let connector = Connector::accepted(
            transport,
            peer,
            self.registry.clone(),
            self.connector_config.clone(),
        );
        connector.add_listener(self.client_listener.clone());
        connector.add_listener(Arc::new(Tracker {
            connectors: Arc::downgrade(&self.connectors),
        }));

        // close() flips the state before draining, so checking it under the
        // lock keeps late arrivals out of a set that is being cleared
        let admitted = {
            let mut connectors = lock(&self.connectors);
            if self.is_running() {
                connectors.insert(connector.id(), connector.clone());
                true
            } else {
                false
            }
        };

        if !admitted {
            connector.close().await;
            return;
        }

        if let Err(e) = connector.start() {
            lock(&self.connectors).remove(&connector.id());
            tracing::warn!("Could not start connector for {}: {}", connector.peer(), e);
        }
    }

    /// Send `message` to every tracked connector
    ///
    /// Failures are reported to the state listener and do not stop delivery
    /// to the others. Returns the number of successful sends; a server that
    /// is not running sends nothing.
    pub async fn broadcast(&self, message: &dyn Message) -> usize {
        if !self.is_running() {
            return 0;
        }

        let mut delivered = 0;
        for connector in self.connectors() {
            if connector.is_closed() {
                lock(&self.connectors).remove(&connector.id());
                continue;
            }
            match connector.send(message).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    self.state_listener
                        .on_exception(&ServerError::SendFailed {
                            peer: connector.peer().to_string(),
                            error,
                        })
                        .await;
                }
            }
        }
        delivered
    }

    /// Stop accepting and close every tracked connector
    ///
    /// Only the first call has an effect. Read loops may still be finishing
    /// when this returns.
    pub async fn close(&self) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        self.shutdown.send_replace(true);
        drop(lock(&self.acceptor).take());

        let connectors: Vec<Arc<Connector>> =
            lock(&self.connectors).drain().map(|(_, c)| c).collect();
        for connector in connectors {
            connector.close().await;
        }

        self.state_listener.on_terminated().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
