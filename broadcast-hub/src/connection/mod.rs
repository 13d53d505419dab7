//! Transport-agnostic connection handle.
//!
//! The hub and the listeners only ever talk to a [`Connection`]; whether the
//! bytes travel over a raw TCP stream or inside WebSocket frames is decided
//! once, when the socket is wrapped.
//!
//! - [`StreamConnection`] wraps any byte stream. One `receive` returns
//!   whatever one read produced, up to the configured read size.
//! - [`FramedConnection`] wraps a WebSocket. The transport delimits frames;
//!   a frame larger than the read size is handed out in pieces, with the
//!   surplus replayed on the following `receive` calls.
//!
//! Both adapters allow one reader and one writer to run concurrently, which
//! is how the server drives them (a read task and a write task per client).

mod framed;
mod stream;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;

pub use framed::FramedConnection;
pub use stream::StreamConnection;

/// Largest chunk a single `receive` hands out unless configured otherwise.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// How long `close` waits for the transport to flush a goodbye.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One peer, seen as a sequence of application frames.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Waits for the next frame.
    ///
    /// Returns `Ok(None)` once the peer has gone away or [`close`] was
    /// called. Dropping the returned future abandons the wait.
    ///
    /// [`close`]: Connection::close
    async fn receive(&self) -> Result<Option<Bytes>, ConnectionError>;

    /// Sends one frame.
    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Closes the connection. Pending and future `receive` calls report a
    /// closed connection, pending and future `send` calls fail. Calling it
    /// more than once is harmless.
    async fn close(&self);

    /// Remote address, for logs.
    fn peer_address(&self) -> &str;
}

/// Latch shared by the read and write side of one connection.
#[derive(Debug)]
struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flips the latch; returns `true` only for the first caller.
    fn trigger(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Bytes already pulled off a transport but not yet handed to a caller.
#[derive(Debug, Default)]
struct Pending {
    buf: Bytes,
}

impl Pending {
    fn new(prefix: Bytes) -> Self {
        Self { buf: prefix }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hands out at most `limit` buffered bytes.
    fn take(&mut self, limit: usize) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        let len = self.buf.len().min(limit);
        Some(self.buf.split_to(len))
    }

    /// Returns the first `limit` bytes of `chunk` and keeps the rest.
    fn split_surplus(&mut self, mut chunk: Bytes, limit: usize) -> Bytes {
        debug_assert!(self.is_empty());
        if chunk.len() > limit {
            self.buf = chunk.split_off(limit);
        }
        chunk
    }
}
