//! Abstract transport seam for shard connections.
//!
//! [`Transport`] dials an endpooint and yields a [`Connection`] that moves
//! whole frames. The TCP implementation is the production path; tests plug in
//! in-process byte streams through [`StreamConnection`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{decode_header, verify_payload, Frame, DEFAULT_MAX_PAYLOAD, FRAME_HEADER_SIZE};

/// An established connection moving whole frames in both directions.
///
/// Send and receive sides are independently locked, so one task may block in
/// `recv_frame` while others send.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Receive the next frame.
    async fn recv_frame(&self) -> Result<Frame>;

    /// Address of the remote peer.
    fn peer_addr(&self) -> &str;
}

/// Dials shard endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the shard at `addr`.
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;
}

/// Read one frame from a raw byte stream.
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut head).await.map_err(map_eof)?;
    let header = decode_header(&head, max_payload)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    verify_payload(&header, &payload)?;

    Ok(Frame { header, payload })
}

/// Write one frame to a raw byte stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await.map_err(map_eof)?;
    writer.flush().await.map_err(map_eof)?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof
        || err.kind() == std::io::ErrorKind::BrokenPipe
        || err.kind() == std::io::ErrorKind::ConnectionReset
    {
        TransportError::ConnectionReset
    } else {
        TransportError::IoError(err)
    }
}

/// A [`Connection`] over any split byte stream.
pub struct StreamConnection<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    peer: String,
    max_payload: u32,
}

impl<R, W> StreamConnection<R, W> {
    /// Wrap a reader/writer pair as a connection.
    pub fn new(reader: R, writer: W, peer: String, max_payload: u32) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            max_payload,
        }
    }
}

#[async_trait]
impl<R, W> Connection for StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.max_payload).await
    }

    fn peer_addr(&self) -> &str {
        &self.peer
    }
}

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
    /// Cap on a single frame payload.
    pub max_payload: u32,
    /// Disable Nagle's algorithm on new connections.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_payload: DEFAULT_MAX_PAYLOAD,
            nodelay: true,
        }
    }
}

/// TCP transport over tokio.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    TransportError::ConnectionRefused {
                        addr: addr.to_string(),
                    }
                } else {
                    TransportError::IoError(e)
                }
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }

        tracing::debug!(addr, "tcp connection established");
        let (reader, writer) = stream.into_split();
        Ok(Box::new(StreamConnection::new(
            reader,
            writer,
            addr.to_string(),
            self.config.max_payload,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameFlags, Opcode};

    fn duplex_pair(max_payload: u32) -> (impl Connection, impl Connection) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            StreamConnection::new(ar, aw, "peer-b".to_string(), max_payload),
            StreamConnection::new(br, bw, "peer-a".to_string(), max_payload),
        )
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (left, right) = duplex_pair(DEFAULT_MAX_PAYLOAD);

        let frame = Frame::new(
            Opcode::SetObject,
            9,
            vec![1, 2, 3, 4, 5],
            FrameFlags::empty(),
        );
        left.send_frame(&frame).await.unwrap();

        let got = right.recv_frame().await.unwrap();
        assert_eq!(got.header.opcode, Opcode::SetObject);
        assert_eq!(got.header.request_id, 9);
        assert_eq!(got.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_order() {
        let (left, right) = duplex_pair(DEFAULT_MAX_PAYLOAD);

        for id in 0..10u64 {
            let frame = Frame::new(Opcode::GetObject, id, vec![id as u8], FrameFlags::empty());
            left.send_frame(&frame).await.unwrap();
        }
        for id in 0..10u64 {
            let got = right.recv_frame().await.unwrap();
            assert_eq!(got.header.request_id, id);
            assert_eq!(got.payload, vec![id as u8]);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_receive() {
        let (left, right) = duplex_pair(16);

        let frame = Frame::new(Opcode::SetObject, 1, vec![0u8; 64], FrameFlags::empty());
        left.send_frame(&frame).await.unwrap();

        assert!(matches!(
            right.recv_frame().await,
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_eof_maps_to_reset() {
        let (left, right) = duplex_pair(DEFAULT_MAX_PAYLOAD);
        drop(left);
        assert!(matches!(
            right.recv_frame().await,
            Err(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Port 1 is never listening on loopback in the test environment.
        let transport = TcpTransport::new(TcpTransportConfig {
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let result = transport.connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();
            let frame = read_frame(&mut reader, DEFAULT_MAX_PAYLOAD).await.unwrap();
            write_frame(&mut writer, &frame).await.unwrap();
        });

        let transport = TcpTransport::default();
        let conn = transport.connect(&addr).await.unwrap();
        let frame = Frame::new(Opcode::GetObject, 3, b"ping".to_vec(), FrameFlags::empty());
        conn.send_frame(&frame).await.unwrap();
        let echoed = conn.recv_frame().await.unwrap();
        assert_eq!(echoed.payload, b"ping");
        server.await.unwrap();
    }
}
