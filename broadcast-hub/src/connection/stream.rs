use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    select,
    sync::Mutex,
    time::timeout,
};

use super::{CLOSE_TIMEOUT, CloseSignal, Connection, ConnectionError, DEFAULT_READ_SIZE, Pending};

/// Raw byte-stream adapter.
pub struct StreamConnection<S> {
    reader: Mutex<StreamReader<S>>,
    writer: Mutex<WriteHalf<S>>,
    peer: String,
    read_size: usize,
    closed: CloseSignal,
}

struct StreamReader<S> {
    half: ReadHalf<S>,
    pending: Pending,
}

impl StreamConnection<TcpStream> {
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?.to_string();
        Ok(Self::new(stream, peer))
    }
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self::with_prefix(stream, peer, Bytes::new())
    }

    /// Wraps a stream whose first bytes were already consumed (for protocol
    /// detection); `prefix` is returned by the first `receive`.
    pub fn with_prefix(stream: S, peer: impl Into<String>, prefix: Bytes) -> Self {
        let (half, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(StreamReader {
                half,
                pending: Pending::new(prefix),
            }),
            writer: Mutex::new(writer),
            peer: peer.into(),
            read_size: DEFAULT_READ_SIZE,
            closed: CloseSignal::new(),
        }
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

        let mut buf = vec![0u8; self.read_size];
        let n = reader.half.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
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
            result = self.write_frame(&frame) => result,
            _ = self.closed.wait() => Err(ConnectionError::Closed),
        }
    }

    async fn close(&self) {
        if !self.closed.trigger() {
            return;
        }
        // An in-flight send observes the latch and drops the lock shortly.
        if let Ok(mut writer) = timeout(CLOSE_TIMEOUT, self.writer.lock()).await {
            let _ = timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
        }
    }

    fn peer_address(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn receive_returns_what_one_read_produced() -> anyhow::Result<()> {
        let (local, mut remote) = duplex(1024);
        let conn = StreamConnection::new(local, "test");

        remote.write_all(b"test message").await?;
        let frame = conn.receive().await?.expect("frame");
        assert_eq!(&frame[..], b"test message");
        Ok(())
    }

    #[tokio::test]
    async fn send_writes_the_frame() -> anyhow::Result<()> {
        let (local, mut remote) = duplex(1024);
        let conn = StreamConnection::new(local, "test");

        conn.send(Bytes::from_static(b"hello")).await?;
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn prefix_is_replayed_before_reading() -> anyhow::Result<()> {
        let (local, mut remote) = duplex(1024);
        let conn = StreamConnection::with_prefix(local, "test", Bytes::from_static(b"\x00\x01"))
            .with_read_size(16);

        remote.write_all(b"rest").await?;
        assert_eq!(&conn.receive().await?.expect("prefix")[..], b"\x00\x01");
        assert_eq!(&conn.receive().await?.expect("rest")[..], b"rest");
        Ok(())
    }

    #[tokio::test]
    async fn peer_hangup_reads_as_closed() -> anyhow::Result<()> {
        let (local, remote) = duplex(64);
        let conn = StreamConnection::new(local, "test");
        drop(remote);
        assert!(conn.receive().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_receive() -> anyhow::Result<()> {
        let (local, _remote) = duplex(64);
        let conn = Arc::new(StreamConnection::new(local, "test"));

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        conn.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await??;
        assert!(result?.is_none());
        assert!(matches!(
            conn.send(Bytes::from_static(b"late")).await,
            Err(ConnectionError::Closed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn peer_address_is_reported() {
        let (local, _remote) = duplex(64);
        let conn = StreamConnection::new(local, "10.0.0.1:4000");
        assert_eq!(conn.peer_address(), "10.0.0.1:4000");
    }
}
