//! Real-time broadcast hub for chat-style messages.
//!
//! Peers connect over raw TCP or WebSocket, announce themselves with a JOIN,
//! and every TEXT / JOIN / LEAVE they send is relayed to everyone else. Each
//! module covers one piece:
//!
//! - [`message`] is the binary wire format shared by both transports.
//! - [`connection`] hides the transport behind one `Connection` trait, with
//!   a byte-stream adapter and a WebSocket adapter.
//! - [`multiplex`] tells raw peers from WebSocket peers by their first bytes
//!   and performs the upgrade handshake itself.
//! - [`hub`] keeps the membership table and fans payloads out without ever
//!   waiting on a slow recipient.
//! - [`session`] runs the read and write loops of one connected peer.
//! - [`server`] accepts sockets and stops cleanly.
//! - [`config`] collects the tunables; [`cli`] exposes them to the binary.
//! - [`client`] is a small chat client used by the binary and the tests.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod hub;
pub mod message;
pub mod multiplex;
pub mod server;
pub mod session;

pub use client::ChatClient;
pub use config::{HandshakeConfig, Protocol, ServerConfig};
pub use hub::Hub;
pub use message::{Message, MessageKind};
pub use server::{Listener, ListenerHandle};
