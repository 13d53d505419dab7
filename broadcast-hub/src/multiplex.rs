//! Serving raw-stream and WebSocket peers on the same port.
//!
//! A WebSocket peer opens with an HTTP request line, so its first four bytes
//! are one of a handful of ASCII method prefixes. A raw peer opens with a
//! wire frame, whose first byte is the message kind (a small integer). The
//! multiplexer reads until it can tell the two apart, then either hands the
//! socket to a [`StreamConnection`] with the bytes read so far queued for
//! replay, or completes the upgrade handshake itself and wraps the socket in
//! a [`FramedConnection`].

use std::{fmt, io, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

use crate::{
    config::{HandshakeConfig, Protocol, ServerConfig},
    connection::{Connection, FramedConnection, StreamConnection},
};

/// Bytes inspected before deciding on a protocol.
const DETECT_LEN: usize = 4;

const REQUEST_PREFIXES: [&[u8; DETECT_LEN]; 8] = [
    b"GET ", b"POST", b"PUT ", b"HEAD", b"OPTI", b"PATC", b"DELE", b"CONN",
];

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("peer closed the connection during {0}")]
    ClosedEarly(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("request head is not valid UTF-8")]
    NotUtf8,
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("method {0} cannot upgrade")]
    Method(String),
    #[error("missing or invalid {0} header")]
    Header(&'static str),
    #[error("origin {0:?} is not allowed")]
    Origin(String),
}

impl HandshakeError {
    /// Status line sent back before closing, if the peer deserves one.
    fn rejection(&self) -> Option<&'static str> {
        match self {
            HandshakeError::Timeout(_) | HandshakeError::ClosedEarly(_) | HandshakeError::Io(_) => {
                None
            }
            HandshakeError::Origin(_) => Some("403 Forbidden"),
            HandshakeError::Method(_) => Some("405 Method Not Allowed"),
            _ => Some("400 Bad Request"),
        }
    }
}

/// Transport chosen for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Framed,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => f.write_str("tcp"),
            Transport::Framed => f.write_str("websocket"),
        }
    }
}

/// Outcome of looking at the first bytes of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Wire frames follow; `prefix` is what was read while deciding.
    Raw { prefix: Bytes },
    /// An HTTP request begins with `prefix`.
    Upgrade { prefix: Bytes },
}

/// True while `seen` could still grow into one of the request prefixes.
fn could_be_request(seen: &[u8]) -> bool {
    let seen = &seen[..seen.len().min(DETECT_LEN)];
    REQUEST_PREFIXES
        .iter()
        .any(|prefix| prefix.starts_with(seen))
}

async fn read_detect_prefix<S>(stream: &mut S, seen: &mut BytesMut) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    while seen.len() < DETECT_LEN && could_be_request(seen) {
        if stream.read_buf(seen).await? == 0 {
            return Err(HandshakeError::ClosedEarly("protocol detection"));
        }
    }
    Ok(())
}

/// Reads until the peer can be classified and returns everything read.
///
/// Each read takes whatever is available (up to `buffer` bytes), so the
/// prefix of a raw peer normally holds its whole first frame. Reading stops
/// as soon as the bytes seen rule out every request prefix, so frames
/// shorter than the look-ahead are still served.
pub async fn detect<S>(
    stream: &mut S,
    limit: Duration,
    buffer: usize,
) -> Result<Detection, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut seen = BytesMut::with_capacity(buffer.max(DETECT_LEN));
    timeout(limit, read_detect_prefix(stream, &mut seen))
        .await
        .map_err(|_| HandshakeError::Timeout("protocol detection"))??;

    let prefix = seen.freeze();
    if prefix.len() >= DETECT_LEN && could_be_request(&prefix) {
        Ok(Detection::Upgrade { prefix })
    } else {
        Ok(Detection::Raw { prefix })
    }
}

/// `base64(sha1(key + GUID))`, the value of `Sec-WebSocket-Accept`.
pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.as_bytes())
}

#[derive(Debug)]
struct UpgradeRequest {
    target: String,
    key: String,
}

fn header<'a>(headers: &'a [(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn parse_upgrade_request(
    head: &[u8],
    config: &HandshakeConfig,
) -> Result<UpgradeRequest, HandshakeError> {
    let head = std::str::from_utf8(head).map_err(|_| HandshakeError::NotUtf8)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(HandshakeError::MalformedRequestLine(request_line.to_string()));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::MalformedRequestLine(request_line.to_string()));
    }
    if *method != "GET" {
        return Err(HandshakeError::Method(method.to_string()));
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;
        headers.push((name.trim(), value.trim()));
    }

    let upgrade = header(&headers, "Upgrade").ok_or(HandshakeError::Header("Upgrade"))?;
    if !has_token(upgrade, "websocket") {
        return Err(HandshakeError::Header("Upgrade"));
    }
    let connection = header(&headers, "Connection").ok_or(HandshakeError::Header("Connection"))?;
    if !has_token(connection, "upgrade") {
        return Err(HandshakeError::Header("Connection"));
    }
    if let Some(version) = header(&headers, "Sec-WebSocket-Version") {
        if version != "13" {
            return Err(HandshakeError::Header("Sec-WebSocket-Version"));
        }
    }

    let key = header(&headers, "Sec-WebSocket-Key")
        .ok_or(HandshakeError::Header("Sec-WebSocket-Key"))?;
    match BASE64.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(HandshakeError::Header("Sec-WebSocket-Key")),
    }

    if let Some(origin) = header(&headers, "Origin") {
        if !config.origin_allowed(origin) {
            return Err(HandshakeError::Origin(origin.to_string()));
        }
    }

    Ok(UpgradeRequest {
        target: target.to_string(),
        key: key.to_string(),
    })
}

/// Reads the request head, starting with the bytes already consumed by
/// detection. Returns the head and whatever arrived after it.
async fn read_request_head<S>(
    stream: &mut S,
    prefix: &[u8],
    max_bytes: usize,
) -> Result<(BytesMut, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    buf.extend_from_slice(prefix);

    loop {
        if let Some(end) = buf
            .windows(HEADER_END.len())
            .position(|window| window == HEADER_END)
        {
            let leftover = buf.split_off(end + HEADER_END.len()).to_vec();
            return Ok((buf, leftover));
        }
        if buf.len() >= max_bytes {
            return Err(HandshakeError::TooLarge(max_bytes));
        }

        buf.reserve(1024);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::ClosedEarly("upgrade handshake"));
        }
    }
}

async fn answer_upgrade<S>(
    stream: &mut S,
    prefix: &[u8],
    config: &HandshakeConfig,
) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = timeout(
        config.timeout,
        read_request_head(stream, prefix, config.max_request_bytes),
    )
    .await
    .map_err(|_| HandshakeError::Timeout("upgrade handshake"))??;

    let request = parse_upgrade_request(&head, config)?;
    debug!(path = %request.target, "accepting websocket upgrade");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&request.key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(leftover)
}

/// Performs the server side of the upgrade handshake. On failure a minimal
/// error response is attempted before the error is returned.
pub async fn accept_upgrade<S>(
    stream: &mut S,
    prefix: &[u8],
    config: &HandshakeConfig,
) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = answer_upgrade(stream, prefix, config).await;

    if let Err(err) = &result {
        if let Some(status) = err.rejection() {
            let response =
                format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
    result
}

/// Turns freshly accepted sockets into [`Connection`]s according to the
/// listener's [`Protocol`].
#[derive(Debug, Clone)]
pub struct Multiplexer {
    protocol: Protocol,
    read_size: usize,
    detect_timeout: Duration,
    handshake: HandshakeConfig,
}

impl Multiplexer {
    pub fn new(protocol: Protocol, config: &ServerConfig) -> Self {
        Self {
            protocol,
            read_size: config.read_size,
            detect_timeout: config.detect_timeout,
            handshake: config.handshake.clone(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn negotiate<S>(
        &self,
        mut stream: S,
        peer: String,
    ) -> Result<(Arc<dyn Connection>, Transport), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let detection = match self.protocol {
            Protocol::Raw => Detection::Raw {
                prefix: Bytes::new(),
            },
            Protocol::WebSocket => Detection::Upgrade {
                prefix: Bytes::new(),
            },
            Protocol::Auto => detect(&mut stream, self.detect_timeout, self.read_size).await?,
        };

        match detection {
            Detection::Raw { prefix } => {
                let connection: Arc<dyn Connection> = Arc::new(
                    StreamConnection::with_prefix(stream, peer, prefix).with_read_size(self.read_size),
                );
                Ok((connection, Transport::Stream))
            }
            Detection::Upgrade { prefix } => {
                let leftover = accept_upgrade(&mut stream, &prefix, &self.handshake).await?;
                let connection: Arc<dyn Connection> = Arc::new(
                    FramedConnection::upgraded(stream, peer, leftover)
                        .await
                        .with_read_size(self.read_size),
                );
                Ok((connection, Transport::Framed))
            }
        }
    }
}
