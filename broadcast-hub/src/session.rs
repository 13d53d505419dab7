//! Per-connection read and write loops.
//!
//! Each session runs two tasks that share nothing but the client's outbound
//! queue: the read loop decodes inbound frames and relays them through the
//! hub, the write loop drains the queue onto the connection. Whichever side
//! fails first closes the connection, which stops the other.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    connection::{Connection, ConnectionError},
    hub::{Client, Hub},
    message::{MAX_MESSAGE_BYTES, Message, MessageKind},
    multiplex::Transport,
};

/// A registered client together with its outbound queue.
pub struct Session {
    hub: Arc<Hub>,
    client: Arc<Client>,
    queue: mpsc::Receiver<Bytes>,
    transport: Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Leave,
}

impl Session {
    /// Creates the client record and registers it with the hub.
    pub async fn open(
        hub: Arc<Hub>,
        connection: Arc<dyn Connection>,
        transport: Transport,
        queue_capacity: usize,
    ) -> Self {
        let (client, queue) = Client::new(hub.next_client_id(), connection, queue_capacity);
        hub.register(&client).await;
        info!(
            client = client.id(),
            peer = client.connection().peer_address(),
            %transport,
            "client connected"
        );
        Self {
            hub,
            client,
            queue,
            transport,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Runs until the peer leaves or the connection fails, then unregisters
    /// the client and closes its connection.
    pub async fn run(self) {
        let Session {
            hub,
            client,
            queue,
            transport,
        } = self;

        let writer = tokio::spawn(write_loop(Arc::clone(client.connection()), queue));
        read_loop(&hub, &client).await;

        hub.unregister(&client).await;
        client.connection().close().await;
        info!(
            client = client.id(),
            peer = client.connection().peer_address(),
            user = client.username().unwrap_or("-"),
            %transport,
            "client disconnected"
        );

        // Dropping the last strong handle drops the queue's sender, which
        // lets the writer drain and exit.
        drop(client);
        if let Err(err) = writer.await {
            warn!(error = ?err, "write task panicked");
        }
    }
}

async fn read_loop(hub: &Hub, client: &Client) {
    let mut inbound = BytesMut::new();
    loop {
        match client.connection().receive().await {
            Ok(Some(chunk)) => {
                inbound.extend_from_slice(&chunk);
                if relay_buffered(hub, client, &mut inbound).await == Flow::Leave {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(
                    client = client.id(),
                    peer = client.connection().peer_address(),
                    error = %err,
                    "read failed"
                );
                return;
            }
        }
    }
}

/// Relays every complete frame at the front of `inbound`.
///
/// A frame cut short by the end of a read stays buffered until the rest
/// arrives. Anything from an undecodable frame onwards is discarded; the
/// connection stays open.
async fn relay_buffered(hub: &Hub, client: &Client, inbound: &mut BytesMut) -> Flow {
    while !inbound.is_empty() {
        match Message::decode_prefix(inbound) {
            Ok((message, used)) => {
                let frame = inbound.split_to(used).freeze();
                if relay_message(hub, client, &message, frame).await == Flow::Leave {
                    return Flow::Leave;
                }
            }
            Err(err) if err.is_incomplete() && inbound.len() < MAX_MESSAGE_BYTES => {
                trace!(
                    client = client.id(),
                    buffered = inbound.len(),
                    "waiting for the rest of a frame"
                );
                return Flow::Continue;
            }
            Err(err) => {
                warn!(
                    client = client.id(),
                    peer = client.connection().peer_address(),
                    discarded = inbound.len(),
                    error = %err,
                    "dropping undecodable frame"
                );
                inbound.clear();
                return Flow::Continue;
            }
        }
    }
    Flow::Continue
}

async fn relay_message(hub: &Hub, client: &Client, message: &Message, frame: Bytes) -> Flow {
    match message.kind() {
        MessageKind::Join => {
            if client.set_username(message.sender()) {
                info!(client = client.id(), user = message.sender(), "user joined");
            } else {
                debug!(
                    client = client.id(),
                    user = client.username().unwrap_or_default(),
                    announced = message.sender(),
                    "join does not change the name"
                );
            }
            hub.broadcast(frame, Some(client.id())).await;
            Flow::Continue
        }
        MessageKind::Text => {
            debug!(
                client = client.id(),
                user = message.sender(),
                bytes = message.content().len(),
                "relaying text"
            );
            hub.broadcast(frame, Some(client.id())).await;
            Flow::Continue
        }
        MessageKind::Leave => {
            info!(client = client.id(), user = message.sender(), "user left");
            hub.broadcast(frame, Some(client.id())).await;
            Flow::Leave
        }
    }
}

async fn write_loop(connection: Arc<dyn Connection>, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(payload) = queue.recv().await {
        if let Err(err) = connection.send(payload).await {
            if !matches!(err, ConnectionError::Closed) {
                warn!(peer = connection.peer_address(), error = %err, "write failed");
            }
            // Wake the read loop so the session winds down.
            connection.close().await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;
    use crate::connection::StreamConnection;

    const WAIT: Duration = Duration::from_secs(1);

    async fn spawn_session(hub: &Arc<Hub>) -> (DuplexStream, JoinHandle<()>) {
        let (local, remote) = duplex(4096);
        let connection: Arc<dyn Connection> = Arc::new(StreamConnection::new(local, "peer"));
        let session = Session::open(Arc::clone(hub), connection, Transport::Stream, 8).await;
        (remote, tokio::spawn(session.run()))
    }

    async fn read_message(peer: &mut DuplexStream) -> anyhow::Result<Message> {
        let mut buf = vec![0u8; 4096];
        let n = timeout(WAIT, peer.read(&mut buf)).await??;
        Ok(Message::decode(&buf[..n])?)
    }

    #[tokio::test]
    async fn join_and_text_reach_other_clients() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, _x_task) = spawn_session(&hub).await;

        x.write_all(&Message::join("x").encode()?).await?;
        assert_eq!(read_message(&mut y).await?, Message::join("x"));

        x.write_all(&Message::text("x", "hello").encode()?).await?;
        assert_eq!(read_message(&mut y).await?, Message::text("x", "hello"));

        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(100), x.read(&mut buf)).await.is_err(),
            "sender must not hear its own messages"
        );
        Ok(())
    }

    #[tokio::test]
    async fn back_to_back_frames_in_one_read_are_split() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, _x_task) = spawn_session(&hub).await;

        let join = Message::join("x").encode()?;
        let text = Message::text("x", "both").encode()?;
        let mut joined = join.to_vec();
        joined.extend_from_slice(&text);
        x.write_all(&joined).await?;

        let mut received = Vec::new();
        while received.len() < joined.len() {
            let mut buf = vec![0u8; 4096];
            let n = timeout(WAIT, y.read(&mut buf)).await??;
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, joined);
        Ok(())
    }

    /// Reads exactly `len` bytes and checks that nothing follows them.
    async fn read_exactly(peer: &mut DuplexStream, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut received = vec![0u8; len];
        timeout(WAIT, peer.read_exact(&mut received)).await??;
        let mut extra = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(100), peer.read(&mut extra)).await.is_err(),
            "no bytes beyond the relayed frame"
        );
        Ok(received)
    }

    #[tokio::test]
    async fn frame_split_across_reads_is_relayed_once() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, _x_task) = spawn_session(&hub).await;

        let frame = Message::text("x", "split in two").encode()?;
        let (head, tail) = frame.split_at(4);
        x.write_all(head).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        x.write_all(tail).await?;

        assert_eq!(read_exactly(&mut y, frame.len()).await?, frame.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn text_larger_than_one_read_arrives_whole() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, _x_task) = spawn_session(&hub).await;

        let frame = Message::text("x", &"a".repeat(5000)).encode()?;
        assert!(frame.len() > crate::connection::DEFAULT_READ_SIZE);
        x.write_all(&frame).await?;

        let received = read_exactly(&mut y, frame.len()).await?;
        assert_eq!(Message::decode(&received)?, Message::text("x", &"a".repeat(5000)));
        assert_eq!(received, frame.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn leave_is_relayed_and_ends_the_session() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, x_task) = spawn_session(&hub).await;
        assert_eq!(hub.client_count().await, 2);

        x.write_all(&Message::leave("x").encode()?).await?;
        assert_eq!(read_message(&mut y).await?, Message::leave("x"));

        timeout(WAIT, x_task).await??;
        assert_eq!(hub.client_count().await, 1);

        let mut buf = [0u8; 8];
        assert_eq!(timeout(WAIT, x.read(&mut buf)).await??, 0, "connection closed");
        Ok(())
    }

    #[tokio::test]
    async fn garbage_does_not_end_the_session() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (mut y, _y_task) = spawn_session(&hub).await;
        let (mut x, _x_task) = spawn_session(&hub).await;

        // A sender that is not UTF-8.
        x.write_all(&[0, 1, 0xff, 0]).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.client_count().await, 2);

        x.write_all(&Message::text("x", "still here").encode()?).await?;
        assert_eq!(read_message(&mut y).await?, Message::text("x", "still here"));
        Ok(())
    }

    #[tokio::test]
    async fn hub_stop_ends_sessions() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (_a, a_task) = spawn_session(&hub).await;
        let (_b, b_task) = spawn_session(&hub).await;

        assert_eq!(hub.stop().await, 2);
        timeout(WAIT, a_task).await??;
        timeout(WAIT, b_task).await??;
        assert_eq!(hub.client_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn peer_hangup_unregisters() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new());
        let (x, x_task) = spawn_session(&hub).await;
        drop(x);

        timeout(WAIT, x_task).await??;
        assert_eq!(hub.client_count().await, 0);
        Ok(())
    }
}
