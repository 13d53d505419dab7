use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::Mutex,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message as WsMessage, error::ProtocolError, protocol::Role,
    },
};
use tracing::trace;

use super::{CLOSE_TIMEOUT, CloseSignal, Connection, ConnectionError, DEFAULT_READ_SIZE, Pending};

/// WebSocket adapter. Frames go out as binary messages.
pub struct FramedConnection<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    reader: Mutex<FramedReader<S>>,
    peer: String,
    read_size: usize,
    closed: CloseSignal,
}

struct FramedReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Pending,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(FramedReader {
                stream,
                pending: Pending::default(),
            }),
            peer: peer.into(),
            read_size: DEFAULT_READ_SIZE,
            closed: CloseSignal::new(),
        }
    }

    /// Wraps a socket on which the server side of the upgrade handshake has
    /// just completed. `leftover` holds bytes that arrived behind the
    /// handshake request and already belong to the framed stream.
    pub async fn upgraded(stream: S, peer: impl Into<String>, leftover: Vec<u8>) -> Self {
        let socket = WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;
        Self::new(socket, peer)
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, ConnectionError> {
        let mut reader = self.reader.lock().await;
        if let Some(chunk) = reader.pending.take(self.read_size) {
            return Ok(Some(chunk));
        }

        loop {
            let data = match reader.stream.next().await {
                None => return Ok(None),
                Some(Err(err)) if is_disconnect(&err) => return Ok(None),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                Some(Ok(WsMessage::Close(frame))) => {
                    trace!(peer = %self.peer, ?frame, "peer sent close frame");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
            };
            return Ok(Some(reader.pending.split_surplus(data, self.read_size)));
        }
    }

    async fn write_frame(&self, frame: Bytes) -> Result<(), ConnectionError> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Binary(frame)).await?;
        Ok(())
    }
}

fn is_disconnect(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Result<Option<Bytes>, ConnectionError> {
        if self.closed.is_closed() {
            return Ok(None);
        }

        select! {
            result = self.read_chunk() => result,
            _ = self.closed.wait() => Ok(None),
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        if self.closed.is_closed() {
            return Err(ConnectionError::Closed);
        }

        select! {
            result = self.write_frame(frame) => result,
            _ = self.closed.wait() => Err(ConnectionError::Closed),
        }
    }

    async fn close(&self) {
        if !self.closed.trigger() {
            return;
        }
        if let Ok(mut sink) = timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
    }

    fn peer_address(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::io::{DuplexStream, duplex};

    use super::*;

    async fn pair() -> (FramedConnection<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (FramedConnection::new(server, "ws-test"), client)
    }

    #[tokio::test]
    async fn receives_whole_binary_frames() -> anyhow::Result<()> {
        let (conn, mut client) = pair().await;
        client.send(WsMessage::binary(b"frame-one".to_vec())).await?;
        client.send(WsMessage::binary(b"frame-two".to_vec())).await?;

        assert_eq!(&conn.receive().await?.expect("first")[..], b"frame-one");
        assert_eq!(&conn.receive().await?.expect("second")[..], b"frame-two");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_is_replayed_across_receives() -> anyhow::Result<()> {
        let (conn, mut client) = pair().await;
        let conn = conn.with_read_size(4);
        client.send(WsMessage::binary(b"abcdefghij".to_vec())).await?;
        client.send(WsMessage::binary(b"next".to_vec())).await?;

        assert_eq!(&conn.receive().await?.expect("chunk")[..], b"abcd");
        assert_eq!(&conn.receive().await?.expect("chunk")[..], b"efgh");
        assert_eq!(&conn.receive().await?.expect("chunk")[..], b"ij");
        assert_eq!(&conn.receive().await?.expect("next frame")[..], b"next");
        Ok(())
    }

    #[tokio::test]
    async fn send_produces_binary_messages() -> anyhow::Result<()> {
        let (conn, mut client) = pair().await;
        conn.send(Bytes::from_static(b"payload")).await?;

        match client.next().await {
            Some(Ok(WsMessage::Binary(data))) => assert_eq!(&data[..], b"payload"),
            other => panic!("unexpected message: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn close_frame_reads_as_closed() -> anyhow::Result<()> {
        let (conn, mut client) = pair().await;
        client.close(None).await?;
        assert!(conn.receive().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn leftover_bytes_are_part_of_the_stream() -> anyhow::Result<()> {
        let (server_io, client_io) = duplex(64 * 1024);
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        client.send(WsMessage::binary(b"early".to_vec())).await?;
        client.send(WsMessage::binary(b"late".to_vec())).await?;

        // Pretend the handshake reader swallowed the first three bytes.
        let mut server_io = server_io;
        let mut swallowed = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut swallowed).await?;

        let conn = FramedConnection::upgraded(server_io, "ws-test", swallowed.to_vec()).await;
        assert_eq!(&conn.receive().await?.expect("early")[..], b"early");
        assert_eq!(&conn.receive().await?.expect("late")[..], b"late");
        Ok(())
    }

    #[tokio::test]
    async fn close_unblocks_receive_and_notifies_peer() -> anyhow::Result<()> {
        let (conn, mut client) = pair().await;
        let conn = Arc::new(conn);
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), reader).await??;
        assert!(result?.is_none());

        match client.next().await {
            Some(Ok(WsMessage::Close(_))) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
        Ok(())
    }
}
