//! Connectors pair a [`Connection`] with a [`MessageRegistry`]
//!
//! The connector decodes whatever its connection reads, dispatches it to the
//! registered handlers and serializes outgoing messages. The same type serves
//! both ends: [`Connector::accepted`] for connections a server accepted and
//! [`Connector::establish`] for a client that opens one.

use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::{
    Connection, ConnectionError, ConnectionListener, ConnectionResult, InputStream,
    DEFAULT_READ_BUFFER_SIZE,
};
use crate::protocol::{
    encode, CodecError, ConnectionCloseClientMessage, ConnectionCloseServerMessage,
    ConnectionEstablishClientMessage, Message, MessageRegistry, PROTOCOL_VERSION,
};

/// Registry whose handlers receive the connector a message arrived on
pub type Registry = MessageRegistry<Arc<Connector>>;

/// Settings shared by all connectors of one endpoint
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Upper bound for sending the courtesy close message
    pub close_timeout: Duration,
    /// Capacity of the buffered input half
    pub read_buffer_size: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_millis(500),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Lifecycle observer of a connector
///
/// Every method has a default, so observers implement only what they need.
#[async_trait]
pub trait ConnectorListener: Send + Sync {
    async fn on_connected(&self, _connector: &Arc<Connector>) {}

    async fn on_disconnected(&self, _connector: &Arc<Connector>) {}

    async fn on_error(&self, connector: &Arc<Connector>, error: &ConnectionError) {
        tracing::warn!("Error on connector {}: {}", connector.peer(), error);
    }
}

/// Logs accepted and closed client connections
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientConnectorListener;

#[async_trait]
impl ConnectorListener for DefaultClientConnectorListener {
    async fn on_connected(&self, connector: &Arc<Connector>) {
        tracing::info!("Accepted client connection from {}", connector.peer());
    }

    async fn on_disconnected(&self, connector: &Arc<Connector>) {
        tracing::info!("Closed client connection from {}", connector.peer());
    }
}

/// Which end of the protocol a connector speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Server-side connector talking to one client
    Server,
    /// Client-side connector talking to the server
    Client,
}

/// One connection plus the registry used to interpret it
pub struct Connector {
    id: Uuid,
    side: Side,
    this: Weak<Connector>,
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    listeners: RwLock<Vec<Arc<dyn ConnectorListener>>>,
    /// Set when `on_connected` is first delivered to the listeners
    connected: AtomicBool,
    config: ConnectorConfig,
}

impl Connector {
    fn new(
        side: Side,
        connection: Arc<Connection>,
        registry: Arc<Registry>,
        config: ConnectorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Connector>| {
            connection.set_listener(this.clone());
            Self {
                id: Uuid::new_v4(),
                side,
                this: this.clone(),
                connection,
                registry,
                listeners: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                config,
            }
        })
    }

    /// Wrap a transport a server accepted
    pub fn accepted<T>(
        transport: T,
        peer: impl Into<String>,
        registry: Arc<Registry>,
        config: ConnectorConfig,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::with_read_buffer(transport, peer, config.read_buffer_size);
        Self::new(Side::Server, connection, registry, config)
    }

    /// Wrap a transport the client opened and send the handshake
    ///
    /// The handshake is written and flushed before this returns, so it is
    /// always the first message the server sees.
    pub async fn establish<T>(
        transport: T,
        peer: impl Into<String>,
        registry: Arc<Registry>,
        config: ConnectorConfig,
    ) -> ConnectionResult<Arc<Self>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::with_read_buffer(transport, peer, config.read_buffer_size);
        let connector = Self::new(Side::Client, connection, registry, config);
        connector
            .send(&ConnectionEstablishClientMessage::new(PROTOCOL_VERSION))
            .await?;
        Ok(connector)
    }

    /// Unique id of this connector
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Description of the remote end
    pub fn peer(&self) -> &str {
        self.connection.peer()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Attach a lifecycle observer
    pub fn add_listener(&self, listener: Arc<dyn ConnectorListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Start the read loop of the underlying connection
    pub fn start(self: &Arc<Self>) -> ConnectionResult<JoinHandle<()>> {
        self.connection.start(self.clone())
    }

    /// Encode `message`, write it and flush
    ///
    /// Concurrent calls are serialized per connection; the bytes of two
    /// messages never interleave.
    pub async fn send(&self, message: &dyn Message) -> ConnectionResult<()> {
        let mut buf = BytesMut::new();
        encode(message, &mut buf)?;
        self.connection.write_frame(&buf).await
    }

    /// Close the connection; only the first call notifies listeners
    pub async fn close(&self) {
        self.connection.close().await;
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectorListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn strong(&self) -> Option<Arc<Connector>> {
        self.this.upgrade()
    }

    /// Fire `on_connected` unless it already fired
    async fn notify_connected(&self, this: &Arc<Connector>) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        for listener in self.listeners() {
            listener.on_connected(this).await;
        }
    }

    async fn send_farewell(&self) {
        let notice: &dyn Message = match self.side {
            Side::Client => &ConnectionCloseClientMessage,
            Side::Server => &ConnectionCloseServerMessage,
        };

        match tokio::time::timeout(self.config.close_timeout, self.send(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Close notice to {} not sent: {}", self.peer(), e),
            Err(_) => tracing::debug!("Close notice to {} timed out", self.peer()),
        }
    }
}

#[async_trait]
impl ConnectionListener for Connector {
    async fn on_connected(&self, _connection: &Connection) {
        if let Some(this) = self.strong() {
            self.notify_connected(&this).await;
        }
    }

    async fn on_disconnected(&self, _connection: &Connection) {
        if let Some(this) = self.strong() {
            // Closed before the read loop came up: observers still get the pair
            self.notify_connected(&this).await;
            for listener in self.listeners() {
                listener.on_disconnected(&this).await;
            }
        }
        self.send_farewell().await;
    }

    async fn read(&self, input: &mut InputStream) -> ConnectionResult<()> {
        let this = self.strong().ok_or(ConnectionError::Closed)?;
        let message = self.registry.decode(input).await?;
        let result = self.registry.dispatch(&this, &*message).await;
        self.registry.recycle(message);
        match result {
            Err(CodecError::NoHandlerRegistered(flag)) => {
                tracing::debug!("Discarded unhandled message {} from {}", flag, self.peer());
                Ok(())
            }
            other => other.map_err(ConnectionError::from),
        }
    }

    async fn on_read_error(&self, _connection: &Connection, error: &ConnectionError) {
        let Some(this) = self.strong() else { return };
        let listeners = self.listeners();
        if listeners.is_empty() {
            tracing::warn!("Error on connector {}: {}", self.peer(), error);
        }
        for listener in listeners {
            listener.on_error(&this, error).await;
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}
