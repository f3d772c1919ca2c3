//! Cluster model and client-side seams for the Lattice key-value store.
//!
//! This crate defines everything a diagnostic client needs to talk about a
//! cluster without owning any of it: the key-space layout, shard-map and
//! directory codecs, endpoint capability records, the transactional client
//! seam, the membership feed, process classes, and the byte-sampling
//! contract replicas use to estimate shard sizes.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod keys;
pub mod map;
pub mod metrics;
pub mod process;
pub mod rpc;

pub use config::ClusterConfig;
pub use db::{Database, RangeResult, Transaction, TransactionOption, Version};
pub use error::{RpcError, TransactionError};
pub use feed::{ClusterFeed, NoSimulation, RoleAssignments, SimProcess, Simulator, WorkerFilter};
pub use keys::KeyRange;
pub use map::{ReplicaDescriptor, ShardTeams};
pub use metrics::{ByteSample, ShardSizeBounds, StorageMetrics};
pub use process::{ClusterRole, Fitness, ProcessClass};
pub use rpc::{
    GetKeyServerLocationsReply, GetKeyServerLocationsRequest, GetKeyValuesReply,
    GetKeyValuesRequest, KeyValue, ReplicaEndpoint, ReplicaId, RoutingNode, RoutingRpc,
    ShardAssignment, StorageRpc, StoreType, WaitMetricsRequest, WorkerEndpoint, WorkerRpc,
};
