//! Endpoint records and RPC seams consumed by diagnostic clients.
//!
//! An endpoint is a capability record: an identity plus an `Arc` handle to
//! the subset of the wire protocol the holder may invoke. The transport
//! behind the handle is owned by the hosting process; dropping an in-flight
//! request future cancels it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::Version;
use crate::error::RpcError;
use crate::keys::KeyRange;
use crate::metrics::StorageMetrics;

/// Opaque identifier of one storage replica (also used for on-disk stores).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u64);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// One key/value pair as returned by a streaming range read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Wire size of the pair.
    pub fn expected_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Snapshot range read against one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetKeyValuesRequest {
    /// Range to read; `begin` is inclusive, `end` exclusive.
    pub range: KeyRange,
    /// Maximum number of pairs to return.
    pub limit: usize,
    /// Maximum total bytes of pairs to return.
    pub limit_bytes: usize,
    /// Snapshot version the read is pinned to.
    pub version: Version,
}

/// Reply to [`GetKeyValuesRequest`]. `more` signals a truncated page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetKeyValuesReply {
    pub data: Vec<KeyValue>,
    pub more: bool,
}

/// Size metrics request for one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitMetricsRequest {
    pub keys: KeyRange,
}

/// Storage engine backing a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    Memory,
    Ssd,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Ssd => write!(f, "ssd"),
        }
    }
}

/// Wire protocol of a storage replica, as seen by diagnostic clients.
#[async_trait]
pub trait StorageRpc: Send + Sync {
    /// Stream one page of `[begin, end)` at the request's snapshot version.
    async fn get_key_values(&self, req: GetKeyValuesRequest)
        -> Result<GetKeyValuesReply, RpcError>;

    /// The replica's own sampled size estimate for a key range.
    async fn wait_metrics(&self, req: WaitMetricsRequest) -> Result<StorageMetrics, RpcError>;

    /// The storage engine type the replica is configured with.
    async fn get_store_type(&self) -> Result<StoreType, RpcError>;
}

/// A storage replica endpoint: identity, address, and its RPC capability.
#[derive(Clone)]
pub struct ReplicaEndpoint {
    pub id: ReplicaId,
    pub address: SocketAddr,
    pub rpc: Arc<dyn StorageRpc>,
}

impl std::fmt::Debug for ReplicaEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

/// Ask a routing node which replicas hold each shard intersecting a range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetKeyServerLocationsRequest {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
    /// Maximum number of shard assignments to return.
    pub limit: usize,
}

/// One shard and the replicas currently serving it.
#[derive(Clone, Debug)]
pub struct ShardAssignment {
    pub range: KeyRange,
    pub replicas: Vec<ReplicaEndpoint>,
}

/// Reply to [`GetKeyServerLocationsRequest`], sorted by range.
#[derive(Clone, Debug, Default)]
pub struct GetKeyServerLocationsReply {
    pub results: Vec<ShardAssignment>,
}

/// Wire protocol of a routing node.
#[async_trait]
pub trait RoutingRpc: Send + Sync {
    async fn get_key_server_locations(
        &self,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply, RpcError>;
}

/// A routing node endpoint.
#[derive(Clone)]
pub struct RoutingNode {
    pub id: u64,
    pub address: SocketAddr,
    pub rpc: Arc<dyn RoutingRpc>,
}

impl std::fmt::Debug for RoutingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingNode")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

/// Wire protocol of a worker process (one per machine slot).
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Ids of every on-disk data store the worker currently hosts.
    async fn disk_stores(&self) -> Result<Vec<ReplicaId>, RpcError>;
}

/// A worker endpoint with its declared process class.
#[derive(Clone)]
pub struct WorkerEndpoint {
    pub address: SocketAddr,
    pub class: crate::process::ProcessClass,
    pub rpc: Arc<dyn WorkerRpc>,
}

impl std::fmt::Debug for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEndpoint")
            .field("address", &self.address)
            .field("class", &self.class)
            .finish()
    }
}

/// Bounded wait applied to every diagnostic RPC.
pub const REPLY_WAIT: Duration = Duration::from_secs(2);

/// Await `fut` for at most [`REPLY_WAIT`]; an elapsed wait becomes
/// [`RpcError::Timeout`]. Dropping the returned future cancels the request.
pub async fn reply_within<T, F>(fut: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    match tokio::time::timeout(REPLY_WAIT, fut).await {
        Ok(reply) => reply,
        Err(_) => Err(RpcError::Timeout),
    }
}
