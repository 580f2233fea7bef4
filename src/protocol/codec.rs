//! Protocol codec for encoding/decoding messages
//!
//! Handles the flag header and the string helpers shared by message payloads.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Message;

/// Size of the flag header preceding every payload
pub const FLAG_SIZE: usize = 2;

/// Readable half of a transport, as seen by message decoders
pub type MessageInput<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown message type: flag {0}")]
    UnknownMessageType(i16),

    #[error("No handler registered for flag {0}")]
    NoHandlerRegistered(i16),

    #[error("String too long: {0} bytes (max: 65535)")]
    StringTooLong(usize),

    #[error("Handler for flag {flag} failed: {error:#}")]
    HandlerFailed { flag: i16, error: anyhow::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encode a message into the wire format
pub fn encode(message: &dyn Message, buf: &mut BytesMut) -> CodecResult<()> {
    buf.put_i16(message.flag());
    message.write_payload(buf)
}

/// Read the flag that starts every message
pub async fn read_flag(input: &mut MessageInput<'_>) -> io::Result<i16> {
    input.read_i16().await
}

/// Write a string as a 2-byte big-endian length followed by its UTF-8 bytes
pub fn put_utf(buf: &mut BytesMut, value: &str) -> CodecResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Read a string written by [`put_utf`]
pub async fn read_utf(input: &mut MessageInput<'_>) -> io::Result<String> {
    let len = input.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionEstablishClientMessage, FLAG_CLIENT_CONNECTION_ESTABLISH};

    #[test]
    fn test_encode_writes_flag_big_endian() {
        let mut buf = BytesMut::new();
        encode(&ConnectionEstablishClientMessage::new(1), &mut buf).unwrap();

        let flag = FLAG_CLIENT_CONNECTION_ESTABLISH.to_be_bytes();
        assert_eq!(&buf[..], &[flag[0], flag[1], 0, 0, 0, 1]);
        assert_eq!(buf.len(), FLAG_SIZE + 4);
    }

    #[tokio::test]
    async fn test_utf_roundtrip() {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, "héllo").unwrap();
        assert_eq!(&buf[..2], &[0, 6]);

        let mut input: &[u8] = &buf;
        assert_eq!(read_utf(&mut input).await.unwrap(), "héllo");
        assert!(input.is_empty());
    }

    #[test]
    fn test_utf_too_long() {
        let mut buf = BytesMut::new();
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            put_utf(&mut buf, &long),
            Err(CodecError::StringTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_utf_invalid_bytes() {
        let bytes = [0u8, 2, 0xff, 0xfe];
        let mut input: &[u8] = &bytes;
        let err = read_utf(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_flag_is_eof() {
        let bytes = [0x80u8];
        let mut input: &[u8] = &bytes;
        let err = read_flag(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
