//! Request multiplexing over a single shard connection.
//!
//! Many concurrent calls share one connection: each caller is assigned a
//! request id and parks on a oneshot channel while a background demux task
//! owns the receive side and routes response frames back by id. Streamed
//! responses (key listing) route to a bounded mpsc channel instead, the
//! `END_STREAM` flag releasing the route.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameFlags, Opcode};
use crate::transport::Connection;

/// Configuration for a multiplexed connection.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Deadline for a unary request/response exchange.
    pub request_timeout: Duration,
    /// Buffer size of the per-stream response channel.
    pub stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            stream_buffer: 16,
        }
    }
}

enum Route {
    Unary(oneshot::Sender<Frame>),
    Stream(mpsc::Sender<Frame>),
}

type RouteTable = Arc<Mutex<HashMap<u64, Route>>>;

/// A shard connection shared by many concurrent callers.
pub struct MuxConnection {
    conn: Arc<dyn Connection>,
    routes: RouteTable,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    demux: Mutex<Option<JoinHandle<()>>>,
    config: MuxConfig,
}

impl MuxConnection {
    /// Wrap a raw connection, spawning the demux task.
    pub fn new(conn: Box<dyn Connection>, config: MuxConfig) -> Self {
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let routes: RouteTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let demux = tokio::spawn(demux_loop(conn.clone(), routes.clone(), closed.clone()));

        Self {
            conn,
            routes,
            next_id: AtomicU64::new(1),
            closed,
            demux: Mutex::new(Some(demux)),
            config,
        }
    }

    /// Address of the remote shard.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }

    /// True once the connection has been closed locally or lost remotely.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue a unary request and wait for its response frame.
    ///
    /// The response may arrive interleaved with other callers' responses; the
    /// demux task routes it here by request id. Error-flagged frames are
    /// returned as frames, interpretation is the caller's business.
    pub async fn call(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Frame> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routes
            .lock()
            .unwrap()
            .insert(request_id, Route::Unary(tx));

        let frame = Frame::new(opcode, request_id, payload, FrameFlags::empty());
        if let Err(e) = self.conn.send_frame(&frame).await {
            self.routes.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                if self.is_closed() {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::ConnectionReset)
                }
            }
            Err(_) => {
                self.routes.lock().unwrap().remove(&request_id);
                Err(TransportError::RequestTimeout {
                    request_id,
                    timeout_ms: self.config.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Issue a server-streaming request.
    ///
    /// Returns a bounded receiver of response frames. The stream ends when
    /// the server sends an `END_STREAM` frame (delivered) or the connection
    /// is lost (channel simply closes).
    pub async fn call_stream(&self, opcode: Opcode, payload: Vec<u8>) -> Result<mpsc::Receiver<Frame>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        self.routes
            .lock()
            .unwrap()
            .insert(request_id, Route::Stream(tx));

        let frame = Frame::new(opcode, request_id, payload, FrameFlags::empty());
        if let Err(e) = self.conn.send_frame(&frame).await {
            self.routes.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        Ok(rx)
    }

    /// Close the connection: stop the demux task and fail all pending calls.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.demux.lock().unwrap().take() {
            handle.abort();
        }
        self.routes.lock().unwrap().clear();
        debug!(peer = self.conn.peer_addr(), "mux connection closed");
    }
}

async fn demux_loop(conn: Arc<dyn Connection>, routes: RouteTable, closed: Arc<AtomicBool>) {
    loop {
        let frame = match conn.recv_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                if !closed.swap(true, Ordering::SeqCst) {
                    warn!(peer = conn.peer_addr(), error = %e, "shard connection lost");
                }
                // Dropping the routes wakes every pending caller.
                routes.lock().unwrap().clear();
                return;
            }
        };

        let request_id = frame.header.request_id;
        let end_stream = frame.header.flags.end_stream;

        let route = {
            let mut table = routes.lock().unwrap();
            match table.remove(&request_id) {
                Some(Route::Stream(tx)) => {
                    // Streams keep their route until the final frame.
                    if !end_stream {
                        table.insert(request_id, Route::Stream(tx.clone()));
                    }
                    Some(Route::Stream(tx))
                }
                other => other,
            }
        };

        match route {
            Some(Route::Unary(tx)) => {
                let _ = tx.send(frame);
            }
            Some(Route::Stream(tx)) => {
                if tx.send(frame).await.is_err() {
                    // Receiver went away (listing cancelled); drop the route.
                    routes.lock().unwrap().remove(&request_id);
                }
            }
            None => {
                debug!(request_id, "dropping response with no waiting caller");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_PAYLOAD;
    use crate::transport::StreamConnection;

    fn connected_pair() -> (MuxConnection, Box<dyn Connection>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let client = MuxConnection::new(
            Box::new(StreamConnection::new(
                ar,
                aw,
                "server".to_string(),
                DEFAULT_MAX_PAYLOAD,
            )),
            MuxConfig {
                request_timeout: Duration::from_secs(2),
                stream_buffer: 4,
            },
        );
        let server: Box<dyn Connection> = Box::new(StreamConnection::new(
            br,
            bw,
            "client".to_string(),
            DEFAULT_MAX_PAYLOAD,
        ));
        (client, server)
    }

    #[tokio::test]
    async fn test_unary_roundtrip() {
        let (client, server) = connected_pair();

        let echo = tokio::spawn(async move {
            let req = server.recv_frame().await.unwrap();
            let resp = Frame::new(
                req.header.opcode.response(),
                req.header.request_id,
                req.payload,
                FrameFlags::empty(),
            );
            server.send_frame(&resp).await.unwrap();
        });

        let resp = client.call(Opcode::GetObject, b"k".to_vec()).await.unwrap();
        assert_eq!(resp.header.opcode, Opcode::GetObjectResponse);
        assert_eq!(resp.payload, b"k");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_route_correctly() {
        let (client, server) = connected_pair();

        let responder = tokio::spawn(async move {
            let first = server.recv_frame().await.unwrap();
            let second = server.recv_frame().await.unwrap();
            // Answer in reverse arrival order.
            for req in [second, first] {
                let resp = Frame::new(
                    req.header.opcode.response(),
                    req.header.request_id,
                    req.payload,
                    FrameFlags::empty(),
                );
                server.send_frame(&resp).await.unwrap();
            }
        });

        let client = Arc::new(client);
        let c1 = client.clone();
        let a = tokio::spawn(async move { c1.call(Opcode::GetObject, b"a".to_vec()).await });
        let c2 = client.clone();
        let b = tokio::spawn(async move { c2.call(Opcode::GetObject, b"b".to_vec()).await });

        assert_eq!(a.await.unwrap().unwrap().payload, b"a");
        assert_eq!(b.await.unwrap().unwrap().payload, b"b");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_delivers_until_end() {
        let (client, server) = connected_pair();

        let producer = tokio::spawn(async move {
            let req = server.recv_frame().await.unwrap();
            for i in 0..3u8 {
                let flags = FrameFlags {
                    end_stream: i == 2,
                    ..Default::default()
                };
                let resp = Frame::new(
                    req.header.opcode.response(),
                    req.header.request_id,
                    vec![i],
                    flags,
                );
                server.send_frame(&resp).await.unwrap();
            }
        });

        let mut rx = client
            .call_stream(Opcode::ListObjectKeys, vec![])
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(frame) = rx.recv().await {
            let end = frame.header.flags.end_stream;
            got.push(frame.payload[0]);
            if end {
                break;
            }
        }
        assert_eq!(got, vec![0, 1, 2]);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (a, _b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let client = MuxConnection::new(
            Box::new(StreamConnection::new(
                ar,
                aw,
                "server".to_string(),
                DEFAULT_MAX_PAYLOAD,
            )),
            MuxConfig {
                request_timeout: Duration::from_millis(50),
                stream_buffer: 4,
            },
        );

        let result = client.call(Opcode::GetObject, vec![]).await;
        assert!(matches!(
            result,
            Err(TransportError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_after_close_fails() {
        let (client, _server) = connected_pair();
        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.call(Opcode::GetObject, vec![]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_call() {
        let (client, server) = connected_pair();
        let client = Arc::new(client);

        let c = client.clone();
        let pending = tokio::spawn(async move { c.call(Opcode::GetObject, vec![]).await });

        // Give the call a moment to register, then sever the connection.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server);

        let result = pending.await.unwrap();
        assert!(result.is_err());
        assert!(client.is_closed());
    }
}
