use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    connection::{Connection, FramedConnection, StreamConnection},
    message::{MAX_MESSAGE_BYTES, Message, MessageKind},
    multiplex::Transport,
};

/// A chat participant speaking the wire format over either transport.
pub struct ChatClient {
    connection: Arc<dyn Connection>,
    transport: Transport,
    username: String,
    inbound: BytesMut,
}

impl ChatClient {
    pub fn new(
        connection: Arc<dyn Connection>,
        transport: Transport,
        username: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            transport,
            username: username.into(),
            inbound: BytesMut::new(),
        }
    }

    pub async fn connect_raw(addr: SocketAddr, username: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let connection = StreamConnection::from_tcp(stream)?;
        Ok(Self::new(Arc::new(connection), Transport::Stream, username))
    }

    /// Connects with a WebSocket upgrade, e.g. to `ws://127.0.0.1:8080/`.
    pub async fn connect_websocket(url: &str, username: impl Into<String>) -> Result<Self> {
        let (socket, _response) = connect_async(url)
            .await
            .with_context(|| format!("failed to open websocket to {url}"))?;
        // Whole frames only; the server never relays anything larger.
        let connection = FramedConnection::new(socket, url).with_read_size(MAX_MESSAGE_BYTES);
        Ok(Self::new(Arc::new(connection), Transport::Framed, username))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer_address(&self) -> &str {
        self.connection.peer_address()
    }

    pub async fn join(&self) -> Result<()> {
        self.send(&Message::join(&self.username)).await
    }

    pub async fn send_text(&self, content: &str) -> Result<()> {
        self.send(&Message::text(&self.username, content)).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(&Message::leave(&self.username)).await
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let frame = message.encode()?;
        self.connection
            .send(frame)
            .await
            .with_context(|| format!("failed to send {} to {}", message.kind(), self.peer_address()))
    }

    /// Waits for the next relayed message. Returns `None` once the server
    /// has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.next_buffered() {
                return Ok(Some(message));
            }
            match self.connection.receive().await? {
                Some(chunk) => self.inbound.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }

    fn next_buffered(&mut self) -> Option<Message> {
        while !self.inbound.is_empty() {
            match Message::decode_prefix(&self.inbound) {
                Ok((message, used)) => {
                    self.inbound.advance(used);
                    return Some(message);
                }
                // A stream read may end in the middle of a frame.
                Err(err)
                    if err.is_incomplete()
                        && self.transport == Transport::Stream
                        && self.inbound.len() < MAX_MESSAGE_BYTES =>
                {
                    return None;
                }
                Err(err) => {
                    warn!(
                        peer = self.peer_address(),
                        discarded = self.inbound.len(),
                        error = %err,
                        "skipping malformed frame"
                    );
                    self.inbound.clear();
                }
            }
        }
        None
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Terminal front end: stdin lines become TEXT messages, relayed events are
/// printed as they arrive.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = connect(&args).await?;
    info!(peer = client.peer_address(), user = client.username(), "connected");
    client.join().await?;

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        select! {
            inbound = client.recv() => match inbound? {
                Some(message) => render_message(&message).await?,
                None => {
                    write_stdout("*** server closed the connection").await?;
                    client.close().await;
                    return Ok(());
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_input(&client, &line).await? {
                        break;
                    }
                }
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = client.leave().await {
        warn!(?error, "failed to announce departure");
    }
    client.close().await;
    Ok(())
}

async fn connect(args: &ClientArgs) -> Result<ChatClient> {
    if args.websocket {
        let url = format!("ws://{}/", args.server);
        ChatClient::connect_websocket(&url, &args.username).await
    } else {
        ChatClient::connect_raw(args.server, &args.username).await
    }
}

/// Returns `false` when the user asked to quit.
async fn handle_input(client: &ChatClient, line: &str) -> Result<bool> {
    let text = line.trim();
    if text.is_empty() {
        return Ok(true);
    }
    if is_quit_command(text) {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    client.send_text(text).await?;
    Ok(true)
}

fn is_quit_command(text: &str) -> bool {
    ["/quit", "quit", "exit"]
        .iter()
        .any(|command| text.eq_ignore_ascii_case(command))
}

fn format_message(message: &Message) -> String {
    match message.kind() {
        MessageKind::Text => format!("[{}]: {}", message.sender(), message.content()),
        MessageKind::Join => format!("*** {} joined the chat", message.sender()),
        MessageKind::Leave => format!("*** {} left the chat", message.sender()),
    }
}

async fn render_message(message: &Message) -> io::Result<()> {
    write_stdout(&format_message(message)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
