//! A pool of shard clients keyed by endpoint identity.
//!
//! The cluster owns its clients exclusively. The client table is read-mostly:
//! it is written only during construction and close, so lookups take a read
//! lock. The cluster hands out `Arc` references bounded by call lifetime and
//! is not responsible for repair or membership change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use tracing::{debug, info};

use fragstor_transport::Transport;

use crate::error::{ClientError, Result};
use crate::shard::{ShardClient, ShardClientConfig};
use crate::token::TokenProvider;

/// A named collection of shard clients, selectable by identity or at random.
pub struct ShardCluster {
    clients: RwLock<HashMap<String, Arc<ShardClient>>>,
    identifiers: Vec<String>,
    namespace: String,
    closed: AtomicBool,
}

impl ShardCluster {
    /// Connect to every endpoint, binding each client to `namespace`.
    ///
    /// Endpoints are deduplicated while preserving order; the endpoint string
    /// is the shard's identifier. Construction is eager and fails fast on the
    /// first endpoint whose served label does not match the expected one.
    pub async fn new(
        transport: &dyn Transport,
        endpoints: &[String],
        namespace: &str,
        token_provider: Option<Arc<dyn TokenProvider>>,
        config: ShardClientConfig,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ClientError::InvalidConfig(
                "no shard endpoints given".to_string(),
            ));
        }
        if namespace.is_empty() {
            return Err(ClientError::InvalidConfig(
                "no/empty namespace given".to_string(),
            ));
        }

        let mut identifiers = Vec::with_capacity(endpoints.len());
        let mut clients = HashMap::with_capacity(endpoints.len());

        for endpoint in endpoints {
            if clients.contains_key(endpoint) {
                continue;
            }
            let client = ShardClient::connect(
                transport,
                endpoint,
                namespace,
                token_provider.clone(),
                config.clone(),
            )
            .await?;

            // Fail fast on a mis-labelled endpoint before accepting it.
            client.get_namespace().await?;

            identifiers.push(endpoint.clone());
            clients.insert(endpoint.clone(), Arc::new(client));
        }

        info!(
            namespace,
            shards = identifiers.len(),
            "shard cluster established"
        );

        Ok(Self {
            clients: RwLock::new(clients),
            identifiers,
            namespace: namespace.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// The namespace every member shard is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The client for a specific shard identifier.
    pub fn get_shard(&self, id: &str) -> Result<Arc<ShardClient>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.clients
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownShard(id.to_string()))
    }

    /// Any `n` distinct, currently-reachable shards, in random order.
    ///
    /// Clients whose connection has been lost are rejected during the pick.
    pub fn get_random_shards(&self, n: usize) -> Result<Vec<Arc<ShardClient>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let table = self.clients.read().unwrap();
        let mut candidates: Vec<&Arc<ShardClient>> = table
            .values()
            .filter(|client| !client.is_closed())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        if candidates.len() < n {
            return Err(ClientError::InsufficientShards {
                requested: n,
                available: candidates.len(),
            });
        }
        Ok(candidates.into_iter().take(n).cloned().collect())
    }

    /// Identifiers of every member shard, in construction order.
    pub fn listed_shard_identifiers(&self) -> Vec<String> {
        self.identifiers.clone()
    }

    /// Number of member shards.
    pub fn count(&self) -> usize {
        self.identifiers.len()
    }

    /// Close every member client. Terminal; further selections fail `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<Arc<ShardClient>> =
            self.clients.write().unwrap().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
        debug!(namespace = %self.namespace, "shard cluster closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fragstor_transport::message::{
        deserialize_message, serialize_message, GetNamespaceResponse,
    };
    use fragstor_transport::protocol::{Frame, FrameFlags, Opcode, DEFAULT_MAX_PAYLOAD};
    use fragstor_transport::transport::{Connection, StreamConnection};

    /// Transport serving only GetNamespace, with one label per endpoint.
    struct LabelTransport {
        labels: HashMap<String, String>,
    }

    #[async_trait]
    impl Transport for LabelTransport {
        async fn connect(
            &self,
            addr: &str,
        ) -> fragstor_transport::Result<Box<dyn Connection>> {
            let label = self.labels.get(addr).cloned().unwrap_or_default();
            let (client_io, server_io) = tokio::io::duplex(1 << 16);
            let (cr, cw) = tokio::io::split(client_io);
            let (sr, sw) = tokio::io::split(server_io);
            let server: Box<dyn Connection> = Box::new(StreamConnection::new(
                sr,
                sw,
                "client".to_string(),
                DEFAULT_MAX_PAYLOAD,
            ));
            tokio::spawn(async move {
                while let Ok(frame) = server.recv_frame().await {
                    if frame.header.opcode != Opcode::GetNamespace {
                        continue;
                    }
                    let resp = Frame::new(
                        Opcode::GetNamespaceResponse,
                        frame.header.request_id,
                        serialize_message(&GetNamespaceResponse {
                            label: label.clone(),
                            nr_objects: 0,
                            read_rph: 0,
                            write_rph: 0,
                        })
                        .unwrap(),
                        FrameFlags::empty(),
                    );
                    // deserialize to keep request shape honest
                    let _: fragstor_transport::message::GetNamespaceRequest =
                        deserialize_message(&frame.payload).unwrap();
                    if server.send_frame(&resp).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Box::new(StreamConnection::new(
                cr,
                cw,
                addr.to_string(),
                DEFAULT_MAX_PAYLOAD,
            )))
        }
    }

    fn transport_for(endpoints: &[&str]) -> LabelTransport {
        LabelTransport {
            labels: endpoints
                .iter()
                .map(|e| (e.to_string(), "ns".to_string()))
                .collect(),
        }
    }

    fn owned(endpoints: &[&str]) -> Vec<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_cluster_construction() {
        let endpoints = ["a:1", "b:1", "c:1"];
        let transport = transport_for(&endpoints);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&endpoints),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(cluster.count(), 3);
        assert_eq!(
            cluster.listed_shard_identifiers(),
            vec!["a:1", "b:1", "c:1"]
        );
        assert_eq!(cluster.namespace(), "ns");
    }

    #[tokio::test]
    async fn test_cluster_deduplicates_endpoints() {
        let transport = transport_for(&["a:1", "b:1"]);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&["a:1", "b:1", "a:1"]),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(cluster.count(), 2);
    }

    #[tokio::test]
    async fn test_cluster_rejects_empty_endpoints() {
        let transport = transport_for(&[]);
        let result = ShardCluster::new(
            &transport,
            &[],
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_cluster_fails_fast_on_mislabelled_endpoint() {
        let mut labels = HashMap::new();
        labels.insert("a:1".to_string(), "ns".to_string());
        labels.insert("b:1".to_string(), "other".to_string());
        let transport = LabelTransport { labels };

        let result = ShardCluster::new(
            &transport,
            &owned(&["a:1", "b:1"]),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::InvalidLabel { .. })));
    }

    #[tokio::test]
    async fn test_get_shard_by_id() {
        let endpoints = ["a:1", "b:1"];
        let transport = transport_for(&endpoints);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&endpoints),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(cluster.get_shard("a:1").unwrap().addr(), "a:1");
        assert!(matches!(
            cluster.get_shard("zzz"),
            Err(ClientError::UnknownShard(_))
        ));
    }

    #[tokio::test]
    async fn test_get_random_shards_distinct() {
        let endpoints = ["a:1", "b:1", "c:1", "d:1"];
        let transport = transport_for(&endpoints);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&endpoints),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();

        let picked = cluster.get_random_shards(3).unwrap();
        let mut ids: Vec<&str> = picked.iter().map(|c| c.addr()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_get_random_shards_insufficient() {
        let endpoints = ["a:1", "b:1"];
        let transport = transport_for(&endpoints);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&endpoints),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            cluster.get_random_shards(3),
            Err(ClientError::InsufficientShards {
                requested: 3,
                available: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_closed_cluster_rejects_selection() {
        let endpoints = ["a:1"];
        let transport = transport_for(&endpoints);
        let cluster = ShardCluster::new(
            &transport,
            &owned(&endpoints),
            "ns",
            None,
            ShardClientConfig::default(),
        )
        .await
        .unwrap();

        cluster.close().await;
        assert!(matches!(cluster.get_shard("a:1"), Err(ClientError::Closed)));
        assert!(matches!(
            cluster.get_random_shards(1),
            Err(ClientError::Closed)
        ));
    }
}
