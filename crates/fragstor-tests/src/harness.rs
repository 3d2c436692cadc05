//! In-memory shard server and cluster harness.
//!
//! [`MemoryShard`] implements the shard wire protocol over in-process duplex
//! connections: an independent key/value namespace with server-side payload
//! checksums, reference lists, and key listing. Fault injection covers the
//! scenarios the engine must survive: taking a shard down and corrupting a
//! stored object in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use fragstor_client::{ShardClientConfig, ShardCluster};
use fragstor_transport::message::*;
use fragstor_transport::protocol::{Frame, FrameFlags, Opcode, DEFAULT_MAX_PAYLOAD};
use fragstor_transport::transport::{Connection, StreamConnection, Transport};
use fragstor_transport::{MuxConfig, RetryConfig, TransportError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    reference_list: Vec<String>,
    checksum: u64,
}

fn fnv64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in data {
        hash = (hash ^ byte as u64).wrapping_mul(0x100000001b3);
    }
    hash
}

/// One in-memory storage shard bound to a namespace label.
pub struct MemoryShard {
    label: String,
    objects: Mutex<HashMap<Vec<u8>, StoredObject>>,
    down: AtomicBool,
    expected_token: Option<String>,
}

impl MemoryShard {
    /// Create a shard serving the given namespace label.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            objects: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            expected_token: None,
        })
    }

    /// Create a shard that rejects requests lacking the given bearer token.
    pub fn with_token(label: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            objects: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            expected_token: Some(token.into()),
        })
    }

    /// Take the shard down (every request fails) or bring it back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Flip one byte of a stored object without updating its checksum, so the
    /// shard reports it corrupted from then on. Returns false if absent.
    pub fn corrupt(&self, key: &[u8]) -> bool {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(key) {
            Some(stored) if !stored.data.is_empty() => {
                stored.data[0] ^= 0xFF;
                true
            }
            _ => false,
        }
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Stored payload size of an object, if present.
    pub fn object_size(&self, key: &[u8]) -> Option<usize> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.len())
    }

    async fn serve(self: Arc<Self>, conn: Box<dyn Connection>) {
        while let Ok(frame) = conn.recv_frame().await {
            let response = self.dispatch(&frame);
            if conn.send_frame(&response).await.is_err() {
                return;
            }
            // A key listing streams its remaining frames after the first.
            if frame.header.opcode == Opcode::ListObjectKeys
                && !response.header.flags.error
                && !response.header.flags.end_stream
            {
                if self.stream_keys(&*conn, frame.header.request_id).await.is_err() {
                    return;
                }
            }
        }
    }

    fn dispatch(&self, frame: &Frame) -> Frame {
        let id = frame.header.request_id;
        let resp_op = frame.header.opcode.response();

        if self.down.load(Ordering::SeqCst) {
            return error_frame(resp_op, id, WireErrorCode::Unavailable, "shard is down");
        }
        if let Some(err) = self.check_auth(frame) {
            return err;
        }

        match frame.header.opcode {
            Opcode::SetObject => match deserialize_message::<SetObjectRequest>(&frame.payload) {
                Ok(req) => {
                    let checksum = fnv64(&req.data);
                    self.objects.lock().unwrap().insert(
                        req.key,
                        StoredObject {
                            data: req.data,
                            reference_list: req.reference_list,
                            checksum,
                        },
                    );
                    ok_frame(resp_op, id, &SetObjectResponse {})
                }
                Err(_) => bad_request(resp_op, id),
            },
            Opcode::GetObject => match deserialize_message::<GetObjectRequest>(&frame.payload) {
                Ok(req) => {
                    let objects = self.objects.lock().unwrap();
                    match objects.get(&req.key) {
                        Some(stored) if fnv64(&stored.data) != stored.checksum => error_frame(
                            resp_op,
                            id,
                            WireErrorCode::ObjectCorrupted,
                            "payload checksum mismatch",
                        ),
                        Some(stored) => ok_frame(
                            resp_op,
                            id,
                            &GetObjectResponse {
                                data: stored.data.clone(),
                                reference_list: stored.reference_list.clone(),
                            },
                        ),
                        None => {
                            error_frame(resp_op, id, WireErrorCode::KeyNotFound, "no such key")
                        }
                    }
                }
                Err(_) => bad_request(resp_op, id),
            },
            Opcode::DeleteObject => {
                match deserialize_message::<DeleteObjectRequest>(&frame.payload) {
                    Ok(req) => {
                        self.objects.lock().unwrap().remove(&req.key);
                        ok_frame(resp_op, id, &DeleteObjectResponse {})
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::ObjectStatus => {
                match deserialize_message::<ObjectStatusRequest>(&frame.payload) {
                    Ok(req) => {
                        let objects = self.objects.lock().unwrap();
                        let status = match objects.get(&req.key) {
                            None => WireObjectStatus::Missing,
                            Some(stored) if fnv64(&stored.data) != stored.checksum => {
                                WireObjectStatus::Corrupted
                            }
                            Some(_) => WireObjectStatus::Ok,
                        };
                        ok_frame(resp_op, id, &ObjectStatusResponse { status })
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::ListObjectKeys => {
                // Acknowledged by streaming; the first frame carries the first
                // key or END_STREAM when the namespace is empty. Handled in
                // `stream_keys`; here return the first frame.
                let objects = self.objects.lock().unwrap();
                let mut keys: Vec<Vec<u8>> = objects.keys().cloned().collect();
                keys.sort();
                match keys.first() {
                    None => end_stream_frame(resp_op, id),
                    Some(first) => stream_frame(resp_op, id, first.clone(), false),
                }
            }
            Opcode::SetReferenceList => {
                match deserialize_message::<SetReferenceListRequest>(&frame.payload) {
                    Ok(req) => {
                        let mut objects = self.objects.lock().unwrap();
                        match objects.get_mut(&req.key) {
                            Some(stored) => {
                                stored.reference_list = req.reference_list;
                                ok_frame(resp_op, id, &SetReferenceListResponse {})
                            }
                            None => error_frame(
                                resp_op,
                                id,
                                WireErrorCode::KeyNotFound,
                                "no such key",
                            ),
                        }
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::GetReferenceList => {
                match deserialize_message::<GetReferenceListRequest>(&frame.payload) {
                    Ok(req) => {
                        let objects = self.objects.lock().unwrap();
                        let reference_list = objects
                            .get(&req.key)
                            .map(|o| o.reference_list.clone())
                            .unwrap_or_default();
                        ok_frame(resp_op, id, &GetReferenceListResponse { reference_list })
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::AppendToReferenceList => {
                match deserialize_message::<AppendToReferenceListRequest>(&frame.payload) {
                    Ok(req) => {
                        let mut objects = self.objects.lock().unwrap();
                        match objects.get_mut(&req.key) {
                            Some(stored) => {
                                for entry in req.reference_list {
                                    if !stored.reference_list.contains(&entry) {
                                        stored.reference_list.push(entry);
                                    }
                                }
                                ok_frame(resp_op, id, &AppendToReferenceListResponse {})
                            }
                            None => error_frame(
                                resp_op,
                                id,
                                WireErrorCode::KeyNotFound,
                                "no such key",
                            ),
                        }
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::DeleteFromReferenceList => {
                match deserialize_message::<DeleteFromReferenceListRequest>(&frame.payload) {
                    Ok(req) => {
                        let mut objects = self.objects.lock().unwrap();
                        match objects.get_mut(&req.key) {
                            Some(stored) => {
                                stored
                                    .reference_list
                                    .retain(|entry| !req.reference_list.contains(entry));
                                let count = stored.reference_list.len() as i64;
                                ok_frame(resp_op, id, &DeleteFromReferenceListResponse { count })
                            }
                            None => ok_frame(
                                resp_op,
                                id,
                                &DeleteFromReferenceListResponse { count: 0 },
                            ),
                        }
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::DeleteReferenceList => {
                match deserialize_message::<DeleteReferenceListRequest>(&frame.payload) {
                    Ok(req) => {
                        if let Some(stored) = self.objects.lock().unwrap().get_mut(&req.key) {
                            stored.reference_list.clear();
                        }
                        ok_frame(resp_op, id, &DeleteReferenceListResponse {})
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::GetReferenceCount => {
                match deserialize_message::<GetReferenceCountRequest>(&frame.payload) {
                    Ok(req) => {
                        let objects = self.objects.lock().unwrap();
                        let count = objects
                            .get(&req.key)
                            .map(|o| o.reference_list.len() as i64)
                            .unwrap_or(0);
                        ok_frame(resp_op, id, &GetReferenceCountResponse { count })
                    }
                    Err(_) => bad_request(resp_op, id),
                }
            }
            Opcode::GetNamespace => ok_frame(
                resp_op,
                id,
                &GetNamespaceResponse {
                    label: self.label.clone(),
                    nr_objects: self.objects.lock().unwrap().len() as u64,
                    read_rph: 0,
                    write_rph: 0,
                },
            ),
            _ => bad_request(resp_op, id),
        }
    }

    /// Stream the remaining keys (the dispatch already sent the first), then
    /// the END_STREAM terminator.
    async fn stream_keys(
        &self,
        conn: &dyn Connection,
        request_id: u64,
    ) -> fragstor_transport::Result<()> {
        let keys: Vec<Vec<u8>> = {
            let objects = self.objects.lock().unwrap();
            let mut keys: Vec<Vec<u8>> = objects.keys().cloned().collect();
            keys.sort();
            keys
        };
        for key in keys.iter().skip(1) {
            conn.send_frame(&stream_frame(
                Opcode::ListObjectKeysResponse,
                request_id,
                key.clone(),
                false,
            ))
            .await?;
        }
        conn.send_frame(&end_stream_frame(Opcode::ListObjectKeysResponse, request_id))
            .await
    }

    fn check_auth(&self, frame: &Frame) -> Option<Frame> {
        let expected = self.expected_token.as_ref()?;
        // Every request body starts with its RequestContext, so decoding the
        // context prefix is enough to read the token.
        let ctx: RequestContext = match deserialize_message_prefix(&frame.payload) {
            Some(ctx) => ctx,
            None => {
                return Some(bad_request(frame.header.opcode.response(), frame.header.request_id))
            }
        };
        if ctx.token.as_deref() != Some(expected.as_str()) {
            return Some(error_frame(
                frame.header.opcode.response(),
                frame.header.request_id,
                WireErrorCode::PermissionDenied,
                "missing or wrong token",
            ));
        }
        None
    }
}

/// Decode only the leading `RequestContext` of a request body. Every request
/// body starts with its context, and `deserialize_from` tolerates the
/// trailing operation-specific fields.
fn deserialize_message_prefix(payload: &[u8]) -> Option<RequestContext> {
    bincode::deserialize_from(std::io::Cursor::new(payload)).ok()
}

fn ok_frame<T: serde::Serialize>(opcode: Opcode, request_id: u64, body: &T) -> Frame {
    Frame::new(
        opcode,
        request_id,
        serialize_message(body).expect("response bodies always serialize"),
        FrameFlags::empty(),
    )
}

fn error_frame(opcode: Opcode, request_id: u64, code: WireErrorCode, message: &str) -> Frame {
    Frame::new(
        opcode,
        request_id,
        serialize_message(&ErrorBody {
            code,
            message: message.to_string(),
        })
        .expect("error bodies always serialize"),
        FrameFlags {
            error: true,
            ..Default::default()
        },
    )
}

fn bad_request(opcode: Opcode, request_id: u64) -> Frame {
    error_frame(
        opcode,
        request_id,
        WireErrorCode::Internal,
        "undecodable request body",
    )
}

fn stream_frame(opcode: Opcode, request_id: u64, key: Vec<u8>, end_stream: bool) -> Frame {
    Frame::new(
        opcode,
        request_id,
        serialize_message(&ListObjectKeysResponse { key })
            .expect("stream bodies always serialize"),
        FrameFlags {
            end_stream,
            ..Default::default()
        },
    )
}

fn end_stream_frame(opcode: Opcode, request_id: u64) -> Frame {
    Frame::new(
        opcode,
        request_id,
        serialize_message(&ListObjectKeysResponse { key: Vec::new() })
            .expect("stream bodies always serialize"),
        FrameFlags {
            end_stream: true,
            ..Default::default()
        },
    )
}

/// A transport whose endpoints resolve to in-memory shards.
pub struct MemoryTransport {
    shards: HashMap<String, Arc<MemoryShard>>,
}

impl MemoryTransport {
    /// Build a transport over the given (endpoint, shard) pairs.
    pub fn new(shards: HashMap<String, Arc<MemoryShard>>) -> Self {
        Self { shards }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: &str) -> fragstor_transport::Result<Box<dyn Connection>> {
        let shard = self
            .shards
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused {
                addr: addr.to_string(),
            })?;

        let (client_io, server_io) = tokio::io::duplex(1 << 22);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);

        let server_conn: Box<dyn Connection> = Box::new(StreamConnection::new(
            sr,
            sw,
            "client".to_string(),
            DEFAULT_MAX_PAYLOAD,
        ));
        tokio::spawn(shard.serve(server_conn));

        Ok(Box::new(StreamConnection::new(
            cr,
            cw,
            addr.to_string(),
            DEFAULT_MAX_PAYLOAD,
        )))
    }
}

/// An assembled test environment: shards, their transport, and a cluster.
pub struct TestEnv {
    shards: Vec<(String, Arc<MemoryShard>)>,
    /// The connected cluster over every shard.
    pub cluster: Arc<ShardCluster>,
}

/// Namespace label used by every harness shard.
pub const TEST_NAMESPACE: &str = "testns";

impl TestEnv {
    /// Spin up `n` shards under one namespace and connect a cluster to them.
    pub async fn with_shards(n: usize) -> Self {
        let shards: Vec<(String, Arc<MemoryShard>)> = (0..n)
            .map(|i| (format!("shard-{}:9000", i), MemoryShard::new(TEST_NAMESPACE)))
            .collect();
        let transport = MemoryTransport::new(shards.iter().cloned().collect());
        let endpoints: Vec<String> = shards.iter().map(|(addr, _)| addr.clone()).collect();

        let cluster = ShardCluster::new(
            &transport,
            &endpoints,
            TEST_NAMESPACE,
            None,
            fast_client_config(),
        )
        .await
        .expect("harness cluster always connects");

        Self {
            shards,
            cluster: Arc::new(cluster),
        }
    }

    /// The shard behind an endpoint identifier.
    pub fn shard(&self, id: &str) -> &Arc<MemoryShard> {
        &self
            .shards
            .iter()
            .find(|(addr, _)| addr == id)
            .expect("unknown shard id")
            .1
    }

    /// Every (endpoint, shard) pair.
    pub fn shards(&self) -> &[(String, Arc<MemoryShard>)] {
        &self.shards
    }

    /// Take down the shards with the given endpoint identifiers.
    pub fn kill(&self, ids: &[&str]) {
        for id in ids {
            self.shard(id).set_down(true);
        }
    }
}

/// Client settings tuned for tests: no retries, short request timeout.
pub fn fast_client_config() -> ShardClientConfig {
    ShardClientConfig {
        mux: MuxConfig {
            request_timeout: std::time::Duration::from_secs(5),
            stream_buffer: 16,
        },
        retry: RetryConfig::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv64_detects_change() {
        assert_ne!(fnv64(b"abc"), fnv64(b"abd"));
        assert_eq!(fnv64(b"abc"), fnv64(b"abc"));
    }

    #[tokio::test]
    async fn test_env_builds_cluster() {
        let env = TestEnv::with_shards(3).await;
        assert_eq!(env.cluster.count(), 3);
        assert_eq!(env.cluster.namespace(), TEST_NAMESPACE);
    }

    #[tokio::test]
    async fn test_corrupt_flips_stored_byte() {
        let env = TestEnv::with_shards(1).await;
        let client = env.cluster.get_shard("shard-0:9000").unwrap();
        let object = fragstor_client::Object {
            key: b"k".to_vec(),
            data: b"payload".to_vec(),
            reference_list: vec![],
        };
        client.set_object(&object).await.unwrap();

        assert!(env.shard("shard-0:9000").corrupt(b"k"));
        assert!(matches!(
            client.get_object(b"k").await,
            Err(fragstor_client::ClientError::Corrupted)
        ));
        assert_eq!(
            client.object_status(b"k").await.unwrap(),
            fragstor_client::ObjectStatus::Corrupted
        );
    }

    #[tokio::test]
    async fn test_down_shard_rejects_requests() {
        let env = TestEnv::with_shards(1).await;
        let client = env.cluster.get_shard("shard-0:9000").unwrap();
        env.kill(&["shard-0:9000"]);
        assert!(matches!(
            client.object_status(b"k").await,
            Err(fragstor_client::ClientError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_token_enforcement() {
        use fragstor_client::{ShardClient, StaticTokenProvider};
        use std::sync::Arc as StdArc;

        let shard = MemoryShard::with_token(TEST_NAMESPACE, "sesame");
        let transport = MemoryTransport::new(
            [("shard-0:9000".to_string(), shard)].into_iter().collect(),
        );

        let denied = ShardClient::connect(
            &transport,
            "shard-0:9000",
            TEST_NAMESPACE,
            None,
            fast_client_config(),
        )
        .await
        .unwrap();
        assert!(matches!(
            denied.object_status(b"k").await,
            Err(fragstor_client::ClientError::PermissionDenied)
        ));

        let granted = ShardClient::connect(
            &transport,
            "shard-0:9000",
            TEST_NAMESPACE,
            Some(StdArc::new(StaticTokenProvider::new("sesame"))),
            fast_client_config(),
        )
        .await
        .unwrap();
        assert_eq!(
            granted.object_status(b"k").await.unwrap(),
            fragstor_client::ObjectStatus::Missing
        );
    }
}
