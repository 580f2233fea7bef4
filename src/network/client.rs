//! netplay Client
//!
//! Opens a TCP connection to a server and wraps it in a client-side
//! [`Connector`].

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::connection::ConnectionError;
use super::connector::{Connector, ConnectorListener, Registry};
use super::NetworkConfig;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Connect to a server by address
///
/// The handshake has been sent and the read loop is running when this
/// returns. `listener` is attached before the loop starts, so it observes
/// `on_connected`.
pub async fn connect(
    server_addr: SocketAddr,
    registry: Arc<Registry>,
    listener: Option<Arc<dyn ConnectorListener>>,
    config: &NetworkConfig,
) -> ClientResult<(Arc<Connector>, JoinHandle<()>)> {
    tracing::info!("Connecting to {}", server_addr);

    let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(server_addr))
        .await
        .map_err(|_| ClientError::Timeout)??;
    stream.set_nodelay(true)?;

    let connector = Connector::establish(
        stream,
        server_addr.to_string(),
        registry,
        config.connector_config(),
    )
    .await?;
    if let Some(listener) = listener {
        connector.add_listener(listener);
    }
    let handle = connector.start()?;

    tracing::info!("Connected to {}", server_addr);
    Ok((connector, handle))
}

/// Connect to a server by hostname
pub async fn connect_hostname(
    hostname: &str,
    registry: Arc<Registry>,
    listener: Option<Arc<dyn ConnectorListener>>,
    config: &NetworkConfig,
) -> ClientResult<(Arc<Connector>, JoinHandle<()>)> {
    let addr = super::resolve_host(hostname, config.port).await?;
    connect(addr, registry, listener, config).await
}
