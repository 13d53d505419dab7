use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use broadcast_hub::{
    Hub, Listener, Protocol,
    cli::{Cli, Command, ServeArgs},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.server_config();
    let hub = Arc::new(Hub::new());

    let bindings = match args.ws_listen {
        None => vec![(args.listen, Protocol::Auto)],
        Some(ws_listen) => vec![(args.listen, Protocol::Raw), (ws_listen, Protocol::WebSocket)],
    };
    let mut listeners = Vec::with_capacity(bindings.len());
    for (addr, protocol) in bindings {
        listeners.push(Listener::bind(addr, protocol, Arc::clone(&hub), &config).await?);
    }

    let mut handles = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let protocol = listener.protocol();
        let handle = listener.spawn()?;
        info!(addr = %handle.addr(), %protocol, "hub listening");
        handles.push(handle);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    info!("shutting down");

    for handle in handles {
        if let Err(err) = handle.stop().await {
            warn!("listener exited with error: {err:?}");
        }
    }
    let closed = hub.stop().await;
    info!(closed, dropped = hub.dropped_count(), "hub stopped");

    Ok(())
}
