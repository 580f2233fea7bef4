//! Opt-in handlers for the built-in connection messages
//!
//! Registries created by `client_defaults` / `server_defaults` only know how
//! to decode these messages. Servers that want to answer them register the
//! handlers below.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

use super::connector::{Connector, Registry};
use crate::protocol::{
    ConnectionAcceptedServerMessage, ConnectionEstablishClientMessage,
    ConnectionPingClientMessage, ConnectionPongServerMessage,
    ConnectionRejectedProtocolMismatchServerMessage, Message, MessageHandler,
    FLAG_CLIENT_CONNECTION_ESTABLISH, FLAG_CLIENT_CONNECTION_PING, PROTOCOL_VERSION,
};

/// Accepts clients speaking `protocol_version` and rejects the rest
#[derive(Debug, Clone, Copy)]
pub struct HandshakeHandler {
    pub protocol_version: i32,
}

impl Default for HandshakeHandler {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

#[async_trait]
impl MessageHandler<Arc<Connector>> for HandshakeHandler {
    async fn handle(&self, connector: &Arc<Connector>, message: &dyn Message) -> anyhow::Result<()> {
        let handshake = message
            .downcast_ref::<ConnectionEstablishClientMessage>()
            .context("expected a handshake message")?;

        if handshake.protocol_version == self.protocol_version {
            tracing::debug!("Client {} accepted", connector.peer());
            connector.send(&ConnectionAcceptedServerMessage).await?;
            return Ok(());
        }

        tracing::info!(
            "Rejecting {}: protocol version {} (expected {})",
            connector.peer(),
            handshake.protocol_version,
            self.protocol_version
        );
        connector
            .send(&ConnectionRejectedProtocolMismatchServerMessage::new(
                self.protocol_version,
            ))
            .await?;
        connector.close().await;
        Ok(())
    }
}

/// Answers every ping with a pong carrying the same timestamp
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

#[async_trait]
impl MessageHandler<Arc<Connector>> for PingHandler {
    async fn handle(&self, connector: &Arc<Connector>, message: &dyn Message) -> anyhow::Result<()> {
        let ping = message
            .downcast_ref::<ConnectionPingClientMessage>()
            .context("expected a ping message")?;
        connector
            .send(&ConnectionPongServerMessage::new(ping.timestamp))
            .await?;
        Ok(())
    }
}

/// Attach the handshake and ping handlers to a server registry
pub fn register_connection_handlers(registry: &mut Registry, protocol_version: i32) {
    registry.register_handler(
        FLAG_CLIENT_CONNECTION_ESTABLISH,
        HandshakeHandler { protocol_version },
    );
    registry.register_handler(FLAG_CLIENT_CONNECTION_PING, PingHandler);
}
