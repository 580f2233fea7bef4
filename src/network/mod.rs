//! Network module - Connections, connectors and the server
//!
//! Provides:
//! - Connection: read loop and serialized writes over one transport
//! - Connector: decodes, dispatches and sends messages through a registry
//! - Server for accepting incoming connections
//! - Client helpers for connecting to servers

mod client;
mod connection;
mod connector;
mod handlers;
mod server;

pub use client::*;
pub use connection::*;
pub use connector::*;
pub use handlers::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for network operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Address the server binds to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for the courtesy close message, in milliseconds
    pub close_timeout_ms: u64,
    /// Capacity of each connection's read buffer
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
            close_timeout_ms: 500,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Settings for the connectors of this endpoint
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            read_buffer_size: self.read_buffer_size,
        }
    }

    /// Address string the server listens on
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
