//! Runtime settings shared by listeners and the protocol multiplexer.

use std::{fmt, str::FromStr, time::Duration};

use crate::connection::DEFAULT_READ_SIZE;

/// Which transports a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Raw byte-stream peers only.
    Raw,
    /// WebSocket peers only; every connection must start with the upgrade
    /// handshake.
    WebSocket,
    /// Both, told apart by the first bytes each peer sends.
    #[default]
    Auto,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Raw => "raw",
            Protocol::WebSocket => "websocket",
            Protocol::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "raw" | "tcp" => Ok(Protocol::Raw),
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            "auto" => Ok(Protocol::Auto),
            other => Err(format!("unknown protocol '{other}' (expected raw, websocket or auto)")),
        }
    }
}

/// Upgrade handshake settings, handed to each listener explicitly.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Origins a browser peer may connect from. Empty allows every origin;
    /// requests without an `Origin` header are always allowed.
    pub allowed_origins: Vec<String>,
    /// Largest request head accepted before giving up.
    pub max_request_bytes: usize,
    /// Time allowed for the full request head to arrive.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_request_bytes: 8 * 1024,
            timeout: Duration::from_secs(5),
        }
    }
}

impl HandshakeConfig {
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Encoded payloads buffered per client before broadcasts to it are dropped.
    pub queue_capacity: usize,
    /// Largest chunk handed out by one `receive`.
    pub read_size: usize,
    /// Time allowed for a new peer to send enough bytes to identify its protocol.
    pub detect_timeout: Duration,
    pub handshake: HandshakeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            read_size: DEFAULT_READ_SIZE,
            detect_timeout: Duration::from_secs(5),
            handshake: HandshakeConfig::default(),
        }
    }
}
