//! Message registry
//!
//! Maps flags to message factories and handlers, decodes incoming messages
//! and keeps a per-type pool of decoded instances for reuse.
//!
//! A registry is filled in while it is still exclusively owned and then
//! shared read-only (usually as an `Arc`) by every connector using it. Only
//! the recycling pool is mutated afterwards.

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    read_flag, AsAny, CodecError, CodecResult, ConnectionAcceptedServerMessage,
    ConnectionCloseClientMessage, ConnectionCloseServerMessage, ConnectionEstablishClientMessage,
    ConnectionPingClientMessage, ConnectionPongServerMessage,
    ConnectionRejectedProtocolMismatchServerMessage, Message, MessageInput,
    FLAG_CLIENT_CONNECTION_CLOSE, FLAG_CLIENT_CONNECTION_ESTABLISH, FLAG_CLIENT_CONNECTION_PING,
    FLAG_SERVER_CONNECTION_ACCEPTED, FLAG_SERVER_CONNECTION_CLOSE, FLAG_SERVER_CONNECTION_PONG,
    FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH,
};

/// Default number of idle instances kept per message type
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// Creates an empty message ready for `read_payload`
pub type MessageFactory = Arc<dyn Fn() -> Box<dyn Message> + Send + Sync>;

/// Handles decoded messages of one flag
///
/// `C` is the context handed to the handler, normally the connector the
/// message arrived on.
#[async_trait]
pub trait MessageHandler<C>: Send + Sync {
    async fn handle(&self, context: &C, message: &dyn Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<C, F> MessageHandler<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(&C, &dyn Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, context: &C, message: &dyn Message) -> anyhow::Result<()> {
        self(context, message)
    }
}

struct MessageType {
    type_id: TypeId,
    factory: MessageFactory,
}

struct Entry<C> {
    message: Option<MessageType>,
    handler: Option<Arc<dyn MessageHandler<C>>>,
}

impl<C> Default for Entry<C> {
    fn default() -> Self {
        Self {
            message: None,
            handler: None,
        }
    }
}

/// Flag -> (factory, handler) lookup table
pub struct MessageRegistry<C> {
    entries: HashMap<i16, Entry<C>>,
    pool: Mutex<HashMap<TypeId, Vec<Box<dyn Message>>>>,
    pool_capacity: usize,
}

impl<C: Send + Sync + 'static> MessageRegistry<C> {
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a registry keeping at most `pool_capacity` idle instances per type.
    /// A capacity of zero disables recycling.
    pub fn with_pool_capacity(pool_capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            pool: Mutex::new(HashMap::new()),
            pool_capacity,
        }
    }

    /// Registry for decoding client -> server connection messages, without handlers
    pub fn client_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_client_messages();
        registry
    }

    /// Registry for decoding server -> client connection messages, without handlers
    pub fn server_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_server_messages();
        registry
    }

    /// Register the built-in messages a server receives
    pub fn register_client_messages(&mut self) {
        self.register_message::<ConnectionCloseClientMessage>(FLAG_CLIENT_CONNECTION_CLOSE);
        self.register_message::<ConnectionEstablishClientMessage>(FLAG_CLIENT_CONNECTION_ESTABLISH);
        self.register_message::<ConnectionPingClientMessage>(FLAG_CLIENT_CONNECTION_PING);
    }

    /// Register the built-in messages a client receives
    pub fn register_server_messages(&mut self) {
        self.register_message::<ConnectionCloseServerMessage>(FLAG_SERVER_CONNECTION_CLOSE);
        self.register_message::<ConnectionAcceptedServerMessage>(FLAG_SERVER_CONNECTION_ACCEPTED);
        self.register_message::<ConnectionRejectedProtocolMismatchServerMessage>(
            FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH,
        );
        self.register_message::<ConnectionPongServerMessage>(FLAG_SERVER_CONNECTION_PONG);
    }

    /// Register the message type decoded for `flag`, replacing any previous one
    pub fn register_message<M: Message + Default>(&mut self, flag: i16) {
        let factory: MessageFactory = Arc::new(|| Box::new(M::default()) as Box<dyn Message>);
        self.entries.entry(flag).or_default().message = Some(MessageType {
            type_id: TypeId::of::<M>(),
            factory,
        });
    }

    /// Register the message type and its handler for `flag`
    pub fn register_message_with_handler<M, H>(&mut self, flag: i16, handler: H)
    where
        M: Message + Default,
        H: MessageHandler<C> + 'static,
    {
        self.register_message::<M>(flag);
        self.register_handler(flag, handler);
    }

    /// Register the handler for `flag`, replacing any previous one
    pub fn register_handler<H: MessageHandler<C> + 'static>(&mut self, flag: i16, handler: H) {
        self.entries.entry(flag).or_default().handler = Some(Arc::new(handler));
    }

    /// Check whether a message type is registered for `flag`
    pub fn is_registered(&self, flag: i16) -> bool {
        self.entries
            .get(&flag)
            .map_or(false, |entry| entry.message.is_some())
    }

    /// Check whether a handler is registered for `flag`
    pub fn has_handler(&self, flag: i16) -> bool {
        self.entries
            .get(&flag)
            .map_or(false, |entry| entry.handler.is_some())
    }

    /// Read one message from `input`
    ///
    /// Fails with [`CodecError::UnknownMessageType`] when the flag has no
    /// registered type; the stream is unusable after that.
    pub async fn decode(&self, input: &mut MessageInput<'_>) -> CodecResult<Box<dyn Message>> {
        let flag = read_flag(input).await?;
        let message_type = self
            .entries
            .get(&flag)
            .and_then(|entry| entry.message.as_ref())
            .ok_or(CodecError::UnknownMessageType(flag))?;

        let mut message = self
            .take_pooled(message_type.type_id)
            .unwrap_or_else(|| (message_type.factory)());
        message.read_payload(input).await?;
        Ok(message)
    }

    /// Hand `message` to the handler registered for its flag
    pub async fn dispatch(&self, context: &C, message: &dyn Message) -> CodecResult<()> {
        let flag = message.flag();
        let handler = self
            .entries
            .get(&flag)
            .and_then(|entry| entry.handler.as_ref())
            .ok_or(CodecError::NoHandlerRegistered(flag))?;

        handler
            .handle(context, message)
            .await
            .map_err(|error| CodecError::HandlerFailed { flag, error })
    }

    /// Return a handled message to the pool
    pub fn recycle(&self, message: Box<dyn Message>) {
        if self.pool_capacity == 0 {
            return;
        }
        let type_id = Any::type_id(AsAny::as_any(&*message));
        let mut pool = self.lock_pool();
        let idle = pool.entry(type_id).or_default();
        if idle.len() < self.pool_capacity {
            idle.push(message);
        }
    }

    /// Number of idle instances pooled for `M`
    pub fn pooled<M: Message>(&self) -> usize {
        self.lock_pool()
            .get(&TypeId::of::<M>())
            .map_or(0, |idle| idle.len())
    }

    fn take_pooled(&self, type_id: TypeId) -> Option<Box<dyn Message>> {
        self.lock_pool().get_mut(&type_id).and_then(|idle| idle.pop())
    }

    fn lock_pool(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Box<dyn Message>>>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Send + Sync + 'static> Default for MessageRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestRegistry = MessageRegistry<()>;

    fn wire(messages: &[&dyn Message]) -> BytesMut {
        let mut buf = BytesMut::new();
        for message in messages {
            encode(*message, &mut buf).unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_decode_roundtrip() {
        let registry = TestRegistry::client_defaults();
        let buf = wire(&[
            &ConnectionEstablishClientMessage::new(3),
            &ConnectionPingClientMessage::new(-99),
        ]);
        let mut input: &[u8] = &buf;

        let first = registry.decode(&mut input).await.unwrap();
        assert_eq!(
            first.downcast_ref::<ConnectionEstablishClientMessage>(),
            Some(&ConnectionEstablishClientMessage::new(3))
        );
        let second = registry.decode(&mut input).await.unwrap();
        assert_eq!(
            second.downcast_ref::<ConnectionPingClientMessage>(),
            Some(&ConnectionPingClientMessage::new(-99))
        );
        assert!(input.is_empty());
    }

    /// Decodes from a reader that borrows a caller-owned buffer
    async fn decode_borrowed(registry: &TestRegistry, bytes: &[u8]) -> CodecResult<i64> {
        let mut reader = tokio::io::BufReader::new(bytes);
        let message = registry.decode(&mut reader).await?;
        let ping = message
            .downcast_ref::<ConnectionPingClientMessage>()
            .map(|ping| ping.timestamp)
            .unwrap_or_default();
        registry.recycle(message);
        Ok(ping)
    }

    #[tokio::test]
    async fn test_decode_from_borrowed_reader() {
        let registry = TestRegistry::client_defaults();
        let buf = wire(&[&ConnectionPingClientMessage::new(12)]);
        let local = buf.to_vec();

        assert_eq!(decode_borrowed(&registry, &local).await.unwrap(), 12);
        assert_eq!(registry.pooled::<ConnectionPingClientMessage>(), 1);
    }

    #[tokio::test]
    async fn test_unknown_flag() {
        let registry = TestRegistry::client_defaults();
        let buf = wire(&[&ConnectionPongServerMessage::new(1)]);
        let mut input: &[u8] = &buf;

        match registry.decode(&mut input).await {
            Err(CodecError::UnknownMessageType(flag)) => {
                assert_eq!(flag, FLAG_SERVER_CONNECTION_PONG)
            }
            other => panic!("Expected UnknownMessageType, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_handler() {
        let registry = TestRegistry::client_defaults();
        let message = ConnectionPingClientMessage::new(5);
        assert!(matches!(
            registry.dispatch(&(), &message).await,
            Err(CodecError::NoHandlerRegistered(FLAG_CLIENT_CONNECTION_PING))
        ));
    }

    #[tokio::test]
    async fn test_register_handler_overwrites() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut registry = TestRegistry::client_defaults();
        let counter = first.clone();
        registry.register_handler(
            FLAG_CLIENT_CONNECTION_PING,
            move |_: &(), _: &dyn Message| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        let counter = second.clone();
        registry.register_handler(
            FLAG_CLIENT_CONNECTION_PING,
            move |_: &(), _: &dyn Message| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        registry
            .dispatch(&(), &ConnectionPingClientMessage::new(1))
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let mut registry = TestRegistry::client_defaults();
        registry.register_handler(
            FLAG_CLIENT_CONNECTION_CLOSE,
            |_: &(), _: &dyn Message| -> anyhow::Result<()> { anyhow::bail!("boom") },
        );

        let err = registry
            .dispatch(&(), &ConnectionCloseClientMessage)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::HandlerFailed {
                flag: FLAG_CLIENT_CONNECTION_CLOSE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recycled_instance_is_reused() {
        let registry = TestRegistry::client_defaults();
        let buf = wire(&[
            &ConnectionPingClientMessage::new(1),
            &ConnectionPingClientMessage::new(2),
        ]);
        let mut input: &[u8] = &buf;

        let first = registry.decode(&mut input).await.unwrap();
        registry.recycle(first);
        assert_eq!(registry.pooled::<ConnectionPingClientMessage>(), 1);

        let second = registry.decode(&mut input).await.unwrap();
        assert_eq!(registry.pooled::<ConnectionPingClientMessage>(), 0);
        assert_eq!(
            second.downcast_ref::<ConnectionPingClientMessage>(),
            Some(&ConnectionPingClientMessage::new(2))
        );
    }

    #[test]
    fn test_pool_capacity_bounds_idle_instances() {
        let registry = TestRegistry::with_pool_capacity(1);
        registry.recycle(Box::new(ConnectionPingClientMessage::new(1)));
        registry.recycle(Box::new(ConnectionPingClientMessage::new(2)));
        assert_eq!(registry.pooled::<ConnectionPingClientMessage>(), 1);

        let disabled = TestRegistry::with_pool_capacity(0);
        disabled.recycle(Box::new(ConnectionPingClientMessage::new(1)));
        assert_eq!(disabled.pooled::<ConnectionPingClientMessage>(), 0);
    }

    #[test]
    fn test_registration_queries() {
        let mut registry = TestRegistry::new();
        assert!(!registry.is_registered(7));

        registry.register_handler(7, |_: &(), _: &dyn Message| -> anyhow::Result<()> { Ok(()) });
        assert!(registry.has_handler(7));
        assert!(!registry.is_registered(7));

        registry.register_message::<ConnectionPingClientMessage>(7);
        assert!(registry.is_registered(7));
    }
}
