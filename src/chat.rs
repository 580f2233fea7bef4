//! Chat messages used by the command line demo

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;

use netplay::protocol::{put_utf, read_utf, CodecResult, Message, MessageInput};

/// Client -> server: a line typed by the user
pub const FLAG_CHAT_CLIENT: i16 = 1;
/// Server -> client: a line relayed to everyone
pub const FLAG_CHAT_SERVER: i16 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatClientMessage {
    pub text: String,
}

#[async_trait]
impl Message for ChatClientMessage {
    fn flag(&self) -> i16 {
        FLAG_CHAT_CLIENT
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        put_utf(buf, &self.text)
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.text = read_utf(input).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatServerMessage {
    pub sender: String,
    pub text: String,
}

#[async_trait]
impl Message for ChatServerMessage {
    fn flag(&self) -> i16 {
        FLAG_CHAT_SERVER
    }

    fn write_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        put_utf(buf, &self.sender)?;
        put_utf(buf, &self.text)
    }

    async fn read_payload(&mut self, input: &mut MessageInput<'_>) -> io::Result<()> {
        self.sender = read_utf(input).await?;
        self.text = read_utf(input).await?;
        Ok(())
    }
}
