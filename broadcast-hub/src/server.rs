//! TCP listeners feeding the hub.
//!
//! A [`Listener`] accepts sockets, hands each one to the [`Multiplexer`] and
//! runs a [`Session`] for every connection that survives negotiation. Any
//! number of listeners may share one [`Hub`]; stopping a listener closes
//! only the connections it accepted.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::{oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    config::{Protocol, ServerConfig},
    connection::Connection,
    hub::{ClientId, Hub},
    multiplex::Multiplexer,
    session::Session,
};

pub struct Listener {
    listener: TcpListener,
    hub: Arc<Hub>,
    multiplexer: Multiplexer,
    queue_capacity: usize,
}

impl Listener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        protocol: Protocol,
        hub: Arc<Hub>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub,
            multiplexer: Multiplexer::new(protocol, config),
            queue_capacity: config.queue_capacity,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn protocol(&self) -> Protocol {
        self.multiplexer.protocol()
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// connection this listener accepted and waits for their sessions.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Listener {
            listener,
            hub,
            multiplexer,
            queue_capacity,
        } = self;
        let addr = listener.local_addr()?;
        let protocol = multiplexer.protocol();
        info!(%addr, %protocol, "listener started");

        let shared = Arc::new(Shared {
            hub,
            multiplexer,
            queue_capacity,
            live: LiveConnections::default(),
        });
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_connection(stream, peer, Arc::clone(&shared)));
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_task_result(finished);
                }
            }
        }

        drop(listener);
        let closed = shared.live.close_all().await;
        info!(%addr, connections = closed, "listener stopping");

        while let Some(finished) = sessions.join_next().await {
            log_task_result(finished);
        }
        info!(%addr, "listener stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the listener on a background task.
    pub fn spawn(self) -> io::Result<ListenerHandle> {
        let addr = self.local_addr()?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = stop_rx.await;
        }));
        Ok(ListenerHandle {
            addr,
            stop_tx,
            task,
        })
    }
}

/// Handle to a listener started with [`Listener::spawn`].
pub struct ListenerHandle {
    addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    /// The bound address, with the real port when bound to port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, closes this listener's connections and waits for
    /// every session it started to finish.
    pub async fn stop(self) -> Result<()> {
        // The task may already have exited; then there is nobody to tell.
        let _ = self.stop_tx.send(());
        self.task.await?
    }
}

struct Shared {
    hub: Arc<Hub>,
    multiplexer: Multiplexer,
    queue_capacity: usize,
    live: LiveConnections,
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let negotiated = select! {
        result = shared.multiplexer.negotiate(stream, peer.to_string()) => result,
        _ = shared.live.stopping() => return,
    };
    let (connection, transport) = match negotiated {
        Ok(negotiated) => negotiated,
        Err(err) => {
            warn!(%peer, error = %err, "rejected connection");
            return;
        }
    };

    let session = Session::open(
        Arc::clone(&shared.hub),
        connection,
        transport,
        shared.queue_capacity,
    )
    .await;
    let id = session.client().id();
    let connection = Arc::clone(session.client().connection());

    if !shared.live.insert(id, Arc::clone(&connection)) {
        // The listener began stopping while this peer was negotiating.
        connection.close().await;
    }
    session.run().await;
    shared.live.remove(id);
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        warn!(error = ?err, "session task failed");
    }
}

/// Connections accepted by one listener, so it can close them on stop.
#[derive(Default)]
struct LiveConnections {
    state: Mutex<LiveState>,
    stopping: StopFlag,
}

#[derive(Default)]
struct LiveState {
    stopping: bool,
    connections: HashMap<ClientId, Arc<dyn Connection>>,
}

impl LiveConnections {
    /// Tracks `connection`; returns `false` once the listener is stopping.
    fn insert(&self, id: ClientId, connection: Arc<dyn Connection>) -> bool {
        let mut state = lock(&self.state);
        if state.stopping {
            return false;
        }
        state.connections.insert(id, connection);
        true
    }

    fn remove(&self, id: ClientId) {
        lock(&self.state).connections.remove(&id);
    }

    async fn stopping(&self) {
        self.stopping.wait().await;
    }

    async fn close_all(&self) -> usize {
        let connections: Vec<_> = {
            let mut state = lock(&self.state);
            state.stopping = true;
            state.connections.drain().map(|(_, connection)| connection).collect()
        };
        self.stopping.raise();

        for connection in &connections {
            connection.close().await;
        }
        connections.len()
    }
}

fn lock(state: &Mutex<LiveState>) -> std::sync::MutexGuard<'_, LiveState> {
    // The guarded map stays consistent even if a holder panicked.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StopFlag {
    tx: watch::Sender<bool>,
}

impl Default for StopFlag {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }
}

impl StopFlag {
    fn raise(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}
