//! Client for a single storage shard.
//!
//! A [`ShardClient`] wraps one long-lived, multiplexed transport connection
//! bound to a fixed namespace label. Every call attaches the label and, when
//! a token provider is configured, a freshly fetched bearer token. Transport
//! errors are translated into [`ClientError`] here and nowhere else.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use fragstor_transport::message::{
    deserialize_message, serialize_message, AppendToReferenceListRequest,
    AppendToReferenceListResponse, DeleteFromReferenceListRequest,
    DeleteFromReferenceListResponse, DeleteObjectRequest, DeleteObjectResponse,
    DeleteReferenceListRequest, DeleteReferenceListResponse, ErrorBody, GetNamespaceRequest,
    GetNamespaceResponse, GetObjectRequest, GetObjectResponse, GetReferenceCountRequest,
    GetReferenceCountResponse, GetReferenceListRequest, GetReferenceListResponse,
    ListObjectKeysRequest, ObjectStatusRequest, ObjectStatusResponse, RequestContext,
    SetObjectRequest, SetObjectResponse, SetReferenceListRequest, SetReferenceListResponse,
};
use fragstor_transport::{
    CancelToken, Frame, MuxConfig, MuxConnection, Opcode, RetryConfig, RetryExecutor, Transport,
};

use crate::error::{from_wire_error, ClientError, Result};
use crate::listing::KeyListing;
use crate::object::{Namespace, Object, ObjectStatus, MAX_REFERENCE_LENGTH};
use crate::token::TokenProvider;

/// Configuration for a shard client connection.
#[derive(Debug, Clone, Default)]
pub struct ShardClientConfig {
    /// Multiplexer settings (request timeout, stream buffering).
    pub mux: MuxConfig,
    /// Retry settings for transient transport failures.
    pub retry: RetryConfig,
}

/// A connection to one storage shard, bound to a namespace label.
pub struct ShardClient {
    conn: MuxConnection,
    addr: String,
    namespace: String,
    label: String,
    token_provider: Option<Arc<dyn TokenProvider>>,
    retry: RetryExecutor,
}

impl ShardClient {
    /// Connect to the shard at `addr`, binding to `namespace`.
    ///
    /// When a token provider is given, the bound label is whatever the
    /// provider maps the namespace to; otherwise the namespace itself.
    pub async fn connect(
        transport: &dyn Transport,
        addr: &str,
        namespace: &str,
        token_provider: Option<Arc<dyn TokenProvider>>,
        config: ShardClientConfig,
    ) -> Result<Self> {
        if addr.is_empty() {
            return Err(ClientError::InvalidConfig(
                "no/empty shard address given".to_string(),
            ));
        }
        if namespace.is_empty() {
            return Err(ClientError::InvalidConfig(
                "no/empty namespace given".to_string(),
            ));
        }

        let label = match &token_provider {
            Some(provider) => provider
                .label_for(namespace)
                .map_err(|e| ClientError::TokenFetch(e.to_string()))?,
            None => namespace.to_string(),
        };

        let conn = transport.connect(addr).await?;
        debug!(addr, namespace, label, "shard client connected");

        Ok(Self {
            conn: MuxConnection::new(conn, config.mux),
            addr: addr.to_string(),
            namespace: namespace.to_string(),
            label,
            token_provider,
            retry: RetryExecutor::new(config.retry),
        })
    }

    /// The shard's endpoint address; doubles as its cluster identifier.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The namespace label this client is bound to.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the underlying connection is closed or lost.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Release the transport connection. Pending calls fail with `Closed`.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Store an object, overwriting any previous value under its key.
    pub async fn set_object(&self, object: &Object) -> Result<()> {
        validate_key(&object.key)?;
        validate_references(&object.reference_list)?;
        let req = SetObjectRequest {
            ctx: self.context()?,
            key: object.key.clone(),
            data: object.data.clone(),
            reference_list: object.reference_list.clone(),
        };
        let _: SetObjectResponse = self.unary(Opcode::SetObject, &req).await?;
        Ok(())
    }

    /// Fetch an object by key.
    pub async fn get_object(&self, key: &[u8]) -> Result<Object> {
        validate_key(key)?;
        let req = GetObjectRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let resp: GetObjectResponse = self.unary(Opcode::GetObject, &req).await?;
        if resp.data.is_empty() {
            return Err(ClientError::MissingData);
        }
        Ok(Object {
            key: key.to_vec(),
            data: resp.data,
            reference_list: resp.reference_list,
        })
    }

    /// Delete an object. Deleting an absent key succeeds.
    pub async fn delete_object(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        let req = DeleteObjectRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let _: DeleteObjectResponse = self.unary(Opcode::DeleteObject, &req).await?;
        Ok(())
    }

    /// Query an object's health status.
    pub async fn object_status(&self, key: &[u8]) -> Result<ObjectStatus> {
        validate_key(key)?;
        let req = ObjectStatusRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let resp: ObjectStatusResponse = self.unary(Opcode::ObjectStatus, &req).await?;
        Ok(resp.status.into())
    }

    /// Whether an object exists. A corrupted object surfaces as an error
    /// rather than `false`.
    pub async fn exists(&self, key: &[u8]) -> Result<bool> {
        match self.object_status(key).await? {
            ObjectStatus::Ok => Ok(true),
            ObjectStatus::Missing => Ok(false),
            ObjectStatus::Corrupted => Err(ClientError::Corrupted),
        }
    }

    /// Fetch the shard's namespace descriptor, verifying its label matches
    /// the one this client is bound to.
    pub async fn get_namespace(&self) -> Result<Namespace> {
        let req = GetNamespaceRequest {
            ctx: self.context()?,
        };
        let resp: GetNamespaceResponse = self.unary(Opcode::GetNamespace, &req).await?;
        if resp.label != self.label {
            return Err(ClientError::InvalidLabel {
                bound: self.label.clone(),
                served: resp.label,
            });
        }
        Ok(Namespace {
            label: resp.label,
            nr_objects: resp.nr_objects,
            read_rph: resp.read_rph,
            write_rph: resp.write_rph,
        })
    }

    /// Begin a finite, cancellable listing of every key in the namespace.
    ///
    /// Items arrive through the returned [`KeyListing`]; cancelling the token
    /// drains the stream to its `Closed` state without further delivery.
    pub async fn list_keys(&self, cancel: CancelToken) -> Result<KeyListing> {
        let req = ListObjectKeysRequest {
            ctx: self.context()?,
        };
        let payload = serialize_message(&req).map_err(ClientError::from)?;
        let frames = self.conn.call_stream(Opcode::ListObjectKeys, payload).await?;
        Ok(KeyListing::spawn(frames, cancel))
    }

    /// Replace an object's reference list.
    pub async fn set_reference_list(&self, key: &[u8], reference_list: &[String]) -> Result<()> {
        validate_key(key)?;
        validate_references(reference_list)?;
        let req = SetReferenceListRequest {
            ctx: self.context()?,
            key: key.to_vec(),
            reference_list: reference_list.to_vec(),
        };
        let _: SetReferenceListResponse = self.unary(Opcode::SetReferenceList, &req).await?;
        Ok(())
    }

    /// Fetch an object's reference list. An empty stored list reports
    /// `MissingRefList`.
    pub async fn get_reference_list(&self, key: &[u8]) -> Result<Vec<String>> {
        validate_key(key)?;
        let req = GetReferenceListRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let resp: GetReferenceListResponse = self.unary(Opcode::GetReferenceList, &req).await?;
        if resp.reference_list.is_empty() {
            return Err(ClientError::MissingRefList);
        }
        Ok(resp.reference_list)
    }

    /// Merge entries into a reference list; the shard drops duplicates.
    pub async fn append_to_reference_list(
        &self,
        key: &[u8],
        reference_list: &[String],
    ) -> Result<()> {
        validate_key(key)?;
        validate_references(reference_list)?;
        let req = AppendToReferenceListRequest {
            ctx: self.context()?,
            key: key.to_vec(),
            reference_list: reference_list.to_vec(),
        };
        let _: AppendToReferenceListResponse =
            self.unary(Opcode::AppendToReferenceList, &req).await?;
        Ok(())
    }

    /// Remove entries from a reference list, returning the resulting count.
    pub async fn delete_from_reference_list(
        &self,
        key: &[u8],
        reference_list: &[String],
    ) -> Result<i64> {
        validate_key(key)?;
        let req = DeleteFromReferenceListRequest {
            ctx: self.context()?,
            key: key.to_vec(),
            reference_list: reference_list.to_vec(),
        };
        let resp: DeleteFromReferenceListResponse =
            self.unary(Opcode::DeleteFromReferenceList, &req).await?;
        Ok(resp.count)
    }

    /// Drop an object's reference list entirely.
    pub async fn delete_reference_list(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        let req = DeleteReferenceListRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let _: DeleteReferenceListResponse = self.unary(Opcode::DeleteReferenceList, &req).await?;
        Ok(())
    }

    /// Count the entries of an object's reference list.
    pub async fn get_reference_count(&self, key: &[u8]) -> Result<i64> {
        validate_key(key)?;
        let req = GetReferenceCountRequest {
            ctx: self.context()?,
            key: key.to_vec(),
        };
        let resp: GetReferenceCountResponse =
            self.unary(Opcode::GetReferenceCount, &req).await?;
        Ok(resp.count)
    }

    /// Build the per-call request context. A failing token provider fails the
    /// call here, before the transport is touched.
    fn context(&self) -> Result<RequestContext> {
        let token = match &self.token_provider {
            Some(provider) => Some(
                provider
                    .token_for(&self.namespace)
                    .map_err(|e| ClientError::TokenFetch(e.to_string()))?,
            ),
            None => None,
        };
        Ok(RequestContext {
            label: self.label.clone(),
            token,
        })
    }

    async fn unary<Req, Resp>(&self, opcode: Opcode, req: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serialize_message(req).map_err(ClientError::from)?;
        let frame = self
            .retry
            .execute(|| self.conn.call(opcode, payload.clone()))
            .await?;
        decode_response(&frame)
    }
}

fn decode_response<Resp: DeserializeOwned>(frame: &Frame) -> Result<Resp> {
    if frame.header.flags.error {
        let body: ErrorBody = deserialize_message(&frame.payload)?;
        return Err(from_wire_error(body.code, &body.message));
    }
    Ok(deserialize_message(&frame.payload)?)
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(ClientError::InvalidKey);
    }
    Ok(())
}

fn validate_references(reference_list: &[String]) -> Result<()> {
    for entry in reference_list {
        if entry.len() > MAX_REFERENCE_LENGTH {
            return Err(ClientError::InvalidConfig(format!(
                "reference entry exceeds {} bytes",
                MAX_REFERENCE_LENGTH
            )));
        }
    }
    Ok(())
}
