//! Transport Codec
//!
//! The session loops only see decoded byte groups. `PacketSink` and
//! `PacketSource` are the two halves a transport must provide; the TCP
//! implementation below uses a 4-byte big-endian length prefix per group as a
//! stand-in for the encrypted stream codec.

use std::future::Future;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Largest byte group the TCP codec accepts (1 MB).
pub const MAX_GROUP_SIZE: u32 = 1024 * 1024;

/// Write half of a transport.
pub trait PacketSink: Send + 'static {
    /// Write one terminated frame.
    fn send_packet(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Read half of a transport.
pub trait PacketSource: Send + 'static {
    /// Read the next decoded byte group. `Ok(None)` is a clean end of stream.
    fn read_packet(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

/// Split a TCP stream into the two transport halves.
pub fn tcp_transport(stream: TcpStream) -> (TcpPacketSink, TcpPacketSource) {
    let (read, write) = stream.into_split();
    (TcpPacketSink { inner: write }, TcpPacketSource { inner: read })
}

/// Length-prefixed TCP writer.
pub struct TcpPacketSink {
    inner: OwnedWriteHalf,
}

impl PacketSink for TcpPacketSink {
    async fn send_packet(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_GROUP_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {MAX_GROUP_SIZE})", data.len()),
            ));
        }
        self.inner.write_all(&(data.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }
}

/// Length-prefixed TCP reader.
pub struct TcpPacketSource {
    inner: OwnedReadHalf,
}

impl PacketSource for TcpPacketSource {
    async fn read_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_GROUP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("group too large: {len} bytes (max {MAX_GROUP_SIZE})"),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

/// In-process transport backed by channels, used by tests and tools.
pub fn channel_transport() -> (ChannelSink, mpsc::UnboundedReceiver<Vec<u8>>, ChannelSource, mpsc::UnboundedSender<Vec<u8>>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        ChannelSink { tx: out_tx },
        out_rx,
        ChannelSource { rx: in_rx },
        in_tx,
    )
}

/// Sink that forwards every frame to a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PacketSink for ChannelSink {
    async fn send_packet(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame receiver dropped"))
    }
}

/// Source that yields groups pushed into a channel; sender drop is EOF.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PacketSource for ChannelSource {
    async fn read_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
