//! netplay - Binary client/server messaging runtime for multiplayer games
//!
//! Applications define typed messages, register them with a
//! [`protocol::MessageRegistry`] under a flag and run either a
//! [`network::Server`] or a client [`network::Connector`] on top of it.

pub mod config;
pub mod network;
pub mod protocol;
