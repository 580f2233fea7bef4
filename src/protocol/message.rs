//! Protocol message definitions
//!
//! A message is identified on the wire by its flag and knows how to write
//! and read its own payload. The built-in connection messages live here;
//! applications define their own the same way.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::any::Any;
use std::fmt;
use std::io;
use tokio::io::AsyncReadExt;

use super::{
    CodecResult, MessageInput, FLAG_CLIENT_CONNECTION_CLOSE, FLAG_CLIENT_CONNECTION_ESTABLISH,
    FLAG_CLIENT_CONNECTION_PING, FLAG_SERVER_CONNECTION_ACCEPTED, FLAG_SERVER_CONNECTION_CLOSE,
    FLAG_SERVER_CONNECTION_PONG, FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH,
    PROTOCOL_VERSION,
};

/// Upcast helper so trait objects can be downcast to their concrete message type
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed protocol message
///
/// `write_payload` and `read_payload` must agree byte for byte: the decoder
/// has no length prefix to fall back on.
#[async_trait]
pub trait Message: AsAny + Send + Sync + fmt::Debug {
    /// Flag identifying this message type on the wire
    fn flag(&self) -> i16;

    /// Append the payload (everything after the flag) to `buf`
    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()>;

    /// Read the payload, overwriting every field of `self`
    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()>;
}

impl dyn Message {
    /// Downcast to a concrete message type
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Check the concrete type of this message
    pub fn is<T: Message>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

/// Handshake sent by every client right after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEstablishClientMessage {
    pub protocol_version: i32,
}

impl ConnectionEstablishClientMessage {
    pub fn new(protocol_version: i32) -> Self {
        Self { protocol_version }
    }
}

impl Default for ConnectionEstablishClientMessage {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

#[async_trait]
impl Message for ConnectionEstablishClientMessage {
    fn flag(&self) -> i16 {
        FLAG_CLIENT_CONNECTION_ESTABLISH
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        buf.put_i32(self.protocol_version);
        Ok(())
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.protocol_version = input.read_i32().await?;
        Ok(())
    }
}

/// Courtesy notice a client sends when its connection goes down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCloseClientMessage;

#[async_trait]
impl Message for ConnectionCloseClientMessage {
    fn flag(&self) -> i16 {
        FLAG_CLIENT_CONNECTION_CLOSE
    }

    fn write_payload(&self, _buf: &mut BytesMut) -> CodecResult<()> {
        Ok(())
    }

    async fn read_payload(&mut self, _input: &mut MessageInput<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Latency check, answered with a [`ConnectionPongServerMessage`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPingClientMessage {
    /// Sender's clock in milliseconds, echoed back unchanged
    pub timestamp: i64,
}

impl ConnectionPingClientMessage {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }
}

#[async_trait]
impl Message for ConnectionPingClientMessage {
    fn flag(&self) -> i16 {
        FLAG_CLIENT_CONNECTION_PING
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        buf.put_i64(self.timestamp);
        Ok(())
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.timestamp = input.read_i64().await?;
        Ok(())
    }
}

/// Courtesy notice a server sends when a client connection goes down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCloseServerMessage;

#[async_trait]
impl Message for ConnectionCloseServerMessage {
    fn flag(&self) -> i16 {
        FLAG_SERVER_CONNECTION_CLOSE
    }

    fn write_payload(&self, _buf: &mut BytesMut) -> CodecResult<()> {
        Ok(())
    }

    async fn read_payload(&mut self, _input: &mut MessageInput<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Positive answer to a client handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionAcceptedServerMessage;

#[async_trait]
impl Message for ConnectionAcceptedServerMessage {
    fn flag(&self) -> i16 {
        FLAG_SERVER_CONNECTION_ACCEPTED
    }

    fn write_payload(&self, _buf: &mut BytesMut) -> CodecResult<()> {
        Ok(())
    }

    async fn read_payload(&mut self, _input: &mut MessageInput<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Negative answer to a client handshake, carrying the server's version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRejectedProtocolMismatchServerMessage {
    pub protocol_version: i32,
}

impl ConnectionRejectedProtocolMismatchServerMessage {
    pub fn new(protocol_version: i32) -> Self {
        Self { protocol_version }
    }
}

impl Default for ConnectionRejectedProtocolMismatchServerMessage {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

#[async_trait]
impl Message for ConnectionRejectedProtocolMismatchServerMessage {
    fn flag(&self) -> i16 {
        FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        buf.put_i32(self.protocol_version);
        Ok(())
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.protocol_version = input.read_i32().await?;
        Ok(())
    }
}

/// Answer to a [`ConnectionPingClientMessage`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPongServerMessage {
    pub timestamp: i64,
}

impl ConnectionPongServerMessage {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }
}

#[async_trait]
impl Message for ConnectionPongServerMessage {
    fn flag(&self) -> i16 {
        FLAG_SERVER_CONNECTION_PONG
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        buf.put_i64(self.timestamp);
        Ok(())
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.timestamp = input.read_i64().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast() {
        let msg: Box<dyn Message> = Box::new(ConnectionPingClientMessage::new(42));
        assert!(msg.is::<ConnectionPingClientMessage>());
        assert!(msg.downcast_ref::<ConnectionPongServerMessage>().is_none());
        assert_eq!(
            msg.downcast_ref::<ConnectionPingClientMessage>().unwrap().timestamp,
            42
        );
    }

    #[test]
    fn test_handshake_payload() {
        let mut buf = BytesMut::new();
        ConnectionEstablishClientMessage::new(7)
            .write_payload(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_empty_messages_consume_nothing() {
        let bytes = [1u8, 2, 3];
        let mut input: &[u8] = &bytes;
        let mut msg = ConnectionAcceptedServerMessage;
        msg.read_payload(&mut input).await.unwrap();
        assert_eq!(input.len(), 3);
    }
}
