//! Protocol module - Defines the wire protocol for netplay communication
//!
//! Every message on the wire is:
//! - 2 bytes flag (signed, big-endian)
//! - Message-defined payload, no length prefix
//!
//! Because there is no outer framing, a payload that fails to decode leaves
//! the stream desynchronized and the connection must be dropped.

mod codec;
mod message;
mod registry;

pub use codec::*;
pub use message::*;
pub use registry::*;

/// Protocol version carried by the client handshake
pub const PROTOCOL_VERSION: i32 = 1;

/// Default port for netplay servers
pub const DEFAULT_PORT: u16 = 24900;

/// Flags of the built-in client -> server connection messages
pub const FLAG_CLIENT_CONNECTION_CLOSE: i16 = i16::MIN;
pub const FLAG_CLIENT_CONNECTION_ESTABLISH: i16 = i16::MIN + 1;
pub const FLAG_CLIENT_CONNECTION_PING: i16 = i16::MIN + 2;

/// Flags of the built-in server -> client connection messages
pub const FLAG_SERVER_CONNECTION_CLOSE: i16 = i16::MIN;
pub const FLAG_SERVER_CONNECTION_ACCEPTED: i16 = i16::MIN + 1;
pub const FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH: i16 = i16::MIN + 2;
pub const FLAG_SERVER_CONNECTION_PONG: i16 = i16::MIN + 3;
