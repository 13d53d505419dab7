//! Membership table and fan-out.
//!
//! The hub never owns a client. Each session owns its [`Client`] through an
//! `Arc`; the hub only keeps a `Weak` per member, so dropping the session is
//! enough to make the client unreachable even if unregistering was missed.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, warn};

use crate::connection::Connection;

pub type ClientId = u64;

/// One connected peer.
pub struct Client {
    id: ClientId,
    connection: Arc<dyn Connection>,
    username: OnceLock<String>,
    outbound: mpsc::Sender<Bytes>,
}

impl Client {
    /// Builds a client with an outbound queue of `capacity` payloads and
    /// returns the receiving end for the session's write task.
    pub fn new(
        id: ClientId,
        connection: Arc<dyn Connection>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            id,
            connection,
            username: OnceLock::new(),
            outbound,
        });
        (client, queue)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Records the name announced by the first JOIN that carries one. An
    /// empty name is ignored; once set, the name is unchanged and later
    /// calls return `false`.
    pub fn set_username(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.username.set(name.to_string()).is_ok()
    }

    fn try_enqueue(&self, payload: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.outbound.try_send(payload)
    }
}

/// Registration table plus broadcast engine, shared by every listener.
#[derive(Default)]
pub struct Hub {
    members: RwLock<HashMap<ClientId, Weak<Client>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register(&self, client: &Arc<Client>) {
        let mut members = self.members.write().await;
        members.insert(client.id, Arc::downgrade(client));
        debug!(client = client.id, members = members.len(), "client registered");
    }

    /// Removes `client`; returns whether it was a member.
    pub async fn unregister(&self, client: &Client) -> bool {
        let mut members = self.members.write().await;
        let removed = members.remove(&client.id).is_some();
        if removed {
            debug!(client = client.id, members = members.len(), "client unregistered");
        }
        removed
    }

    /// Queues `payload` for every member except `excluding`.
    ///
    /// Never waits on a recipient: a member whose queue is full simply
    /// misses this payload. Returns how many members it was queued for.
    pub async fn broadcast(&self, payload: Bytes, excluding: Option<ClientId>) -> usize {
        let members = self.members.read().await;
        let mut delivered = 0;

        for (&id, member) in members.iter() {
            if Some(id) == excluding {
                continue;
            }
            let Some(client) = member.upgrade() else {
                continue;
            };
            match client.try_enqueue(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        client = id,
                        peer = client.connection.peer_address(),
                        dropped_total = dropped,
                        "outbound queue full, dropping payload"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = id, "outbound queue closed, skipping");
                }
            }
        }

        delivered
    }

    pub async fn client_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Payloads dropped so far because a recipient's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes every member's connection and empties the table. Sessions
    /// notice the closed connections and wind down on their own. Returns
    /// how many connections were closed.
    pub async fn stop(&self) -> usize {
        let clients: Vec<Arc<Client>> = {
            let mut members = self.members.write().await;
            members.drain().filter_map(|(_, member)| member.upgrade()).collect()
        };

        info!(clients = clients.len(), "hub stopping");
        join_all(clients.iter().map(|client| client.connection.close())).await;
        clients.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{DuplexStream, duplex},
        time::timeout,
    };

    use super::*;
    use crate::connection::StreamConnection;

    fn client(hub: &Hub, capacity: usize) -> (Arc<Client>, mpsc::Receiver<Bytes>, DuplexStream) {
        let (local, remote) = duplex(1024);
        let connection: Arc<dyn Connection> = Arc::new(StreamConnection::new(local, "test-peer"));
        let (client, queue) = Client::new(hub.next_client_id(), connection, capacity);
        (client, queue, remote)
    }

    #[tokio::test]
    async fn register_and_unregister_track_membership() {
        let hub = Hub::new();
        let (a, _qa, _ra) = client(&hub, 4);
        let (b, _qb, _rb) = client(&hub, 4);

        hub.register(&a).await;
        assert_eq!(hub.client_count().await, 1);
        hub.register(&b).await;
        assert_eq!(hub.client_count().await, 2);

        assert!(hub.unregister(&a).await);
        assert_eq!(hub.client_count().await, 1);

        assert!(!hub.unregister(&a).await, "second unregister is a no-op");
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_skips_only_the_sender() {
        let hub = Hub::new();
        let (sender, mut sender_queue, _r0) = client(&hub, 4);
        let mut others = Vec::new();
        for _ in 0..3 {
            let (c, q, r) = client(&hub, 4);
            hub.register(&c).await;
            others.push((c, q, r));
        }
        hub.register(&sender).await;

        let payload = Bytes::from_static(b"frame");
        let delivered = hub.broadcast(payload.clone(), Some(sender.id())).await;
        assert_eq!(delivered, 3);

        for (_, queue, _) in others.iter_mut() {
            assert_eq!(queue.try_recv().ok(), Some(payload.clone()));
            assert!(queue.try_recv().is_err(), "exactly one copy per recipient");
        }
        assert!(sender_queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_clients_receive_nothing() {
        let hub = Hub::new();
        let (member, mut member_queue, _r1) = client(&hub, 4);
        let (outsider, mut outsider_queue, _r2) = client(&hub, 4);
        hub.register(&member).await;
        hub.register(&outsider).await;
        hub.unregister(&outsider).await;

        hub.broadcast(Bytes::from_static(b"hi"), None).await;
        assert!(member_queue.try_recv().is_ok());
        assert!(outsider_queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking_others() -> anyhow::Result<()> {
        let hub = Hub::new();
        let (slow, mut slow_queue, _r1) = client(&hub, 1);
        let (fast, mut fast_queue, _r2) = client(&hub, 8);
        hub.register(&slow).await;
        hub.register(&fast).await;

        hub.broadcast(Bytes::from_static(b"one"), None).await;
        let delivered = timeout(
            Duration::from_secs(1),
            hub.broadcast(Bytes::from_static(b"two"), None),
        )
        .await?;

        assert_eq!(delivered, 1, "only the fast client had room");
        assert_eq!(hub.dropped_count(), 1);
        assert_eq!(fast_queue.try_recv().ok(), Some(Bytes::from_static(b"one")));
        assert_eq!(fast_queue.try_recv().ok(), Some(Bytes::from_static(b"two")));
        assert_eq!(slow_queue.try_recv().ok(), Some(Bytes::from_static(b"one")));
        assert!(slow_queue.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_clients_are_skipped() {
        let hub = Hub::new();
        let (gone, _q, _r) = client(&hub, 4);
        hub.register(&gone).await;
        drop(gone);

        assert_eq!(hub.broadcast(Bytes::from_static(b"x"), None).await, 0);
    }

    #[tokio::test]
    async fn username_is_fixed_by_first_join() {
        let hub = Hub::new();
        let (c, _q, _r) = client(&hub, 1);
        assert_eq!(c.username(), None);
        assert!(c.set_username("alice"));
        assert!(!c.set_username("mallory"));
        assert_eq!(c.username(), Some("alice"));
    }

    #[tokio::test]
    async fn empty_join_name_leaves_username_unset() {
        let hub = Hub::new();
        let (c, _q, _r) = client(&hub, 1);
        assert!(!c.set_username(""));
        assert_eq!(c.username(), None);
        assert!(c.set_username("bob"));
        assert_eq!(c.username(), Some("bob"));
    }

    #[tokio::test]
    async fn stop_closes_members_and_empties_table() -> anyhow::Result<()> {
        let hub = Hub::new();
        let (a, _qa, _ra) = client(&hub, 1);
        let (b, _qb, _rb) = client(&hub, 1);
        hub.register(&a).await;
        hub.register(&b).await;

        assert_eq!(hub.stop().await, 2);
        assert_eq!(hub.client_count().await, 0);
        assert!(a.connection().receive().await?.is_none());
        assert!(b.connection().receive().await?.is_none());
        Ok(())
    }
}
