use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{HandshakeConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, accepting raw TCP and WebSocket peers.
    Serve(ServeArgs),
    /// Connect to a hub and take part in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on. Without `--ws-listen` this port accepts both
    /// transports; with it, raw TCP only. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Separate address for WebSocket peers.
    #[arg(long)]
    pub ws_listen: Option<SocketAddr>,

    /// Payloads buffered per client before broadcasts to it are dropped.
    #[arg(long, default_value_t = 10)]
    pub queue_capacity: usize,

    /// Seconds a new peer has to identify its protocol.
    #[arg(long, default_value_t = 5)]
    pub detect_timeout_secs: u64,

    /// Origins allowed to open WebSocket connections. May be repeated;
    /// when absent every origin is accepted.
    #[arg(long = "allow-origin")]
    pub allowed_origins: Vec<String>,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            queue_capacity: self.queue_capacity,
            detect_timeout: Duration::from_secs(self.detect_timeout_secs),
            handshake: HandshakeConfig {
                allowed_origins: self.allowed_origins.clone(),
                ..HandshakeConfig::default()
            },
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name announced when joining.
    #[arg(long)]
    pub username: String,

    /// Address of the hub.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,

    /// Connect with a WebSocket upgrade instead of raw TCP.
    #[arg(long)]
    pub websocket: bool,
}
