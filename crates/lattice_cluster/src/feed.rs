//! Live cluster membership feed and the simulation harness seam.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TransactionError;
use crate::map::ReplicaDescriptor;
use crate::process::ProcessClass;
use crate::rpc::{ReplicaEndpoint, ReplicaId, RoutingNode, WorkerEndpoint};

/// Which workers to list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerFilter {
    All,
    NonExcluded,
}

/// Addresses of the processes currently filling each singleton/pooled role.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleAssignments {
    pub cluster_controller: Option<SocketAddr>,
    pub master: Option<SocketAddr>,
    pub proxies: Vec<SocketAddr>,
    pub resolvers: Vec<SocketAddr>,
}

/// Continuously-updated view of cluster membership and health gauges.
#[async_trait]
pub trait ClusterFeed: Send + Sync {
    /// The current routing nodes.
    async fn routing_nodes(&self) -> Vec<RoutingNode>;

    /// Resolves when the routing node set changes. Used to abandon fan-outs
    /// addressed to a stale set.
    async fn routing_changed(&self);

    /// The current worker roster.
    async fn workers(&self, filter: WorkerFilter)
        -> Result<Vec<WorkerEndpoint>, TransactionError>;

    /// Address and store id of every live transaction log.
    fn log_stores(&self) -> Vec<(SocketAddr, ReplicaId)>;

    /// Current role assignments.
    fn roles(&self) -> RoleAssignments;

    /// Turn a directory entry into a live endpoint.
    fn connect(&self, descriptor: &ReplicaDescriptor) -> ReplicaEndpoint;

    /// Bytes in flight or queued in data distribution.
    async fn data_distribution_queue_bytes(&self) -> Result<i64, TransactionError>;

    /// Largest queue across transaction logs.
    async fn max_log_queue_bytes(&self) -> Result<i64, TransactionError>;

    /// Largest durability lag queue across storage replicas. May fail with
    /// [`TransactionError::AttributeNotFound`] when a replica does not track
    /// the gauge.
    async fn max_replica_queue_bytes(&self) -> Result<i64, TransactionError>;
}

/// One process known to the simulation harness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimProcess {
    pub address: SocketAddr,
    /// Harness-assigned process name; cluster members are named "Server".
    pub name: String,
    pub class: ProcessClass,
    /// Whether the harness guarantees this process stays up.
    pub reliable: bool,
    pub failed: bool,
}

/// Simulation harness seam. Outside simulation every accessor is inert.
pub trait Simulator: Send + Sync {
    fn is_simulated(&self) -> bool;

    /// Every process the harness is running.
    fn processes(&self) -> Vec<SimProcess>;

    fn process_at(&self, address: SocketAddr) -> Option<SimProcess>;

    /// Ask the harness to reboot the process at `address`.
    fn reboot(&self, address: SocketAddr);
}

/// The no-op harness used outside simulation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSimulation;

impl Simulator for NoSimulation {
    fn is_simulated(&self) -> bool {
        false
    }

    fn processes(&self) -> Vec<SimProcess> {
        Vec::new()
    }

    fn process_at(&self, _address: SocketAddr) -> Option<SimProcess> {
        None
    }

    fn reboot(&self, address: SocketAddr) {
        tracing::warn!(%address, "reboot requested outside simulation; ignored");
    }
}
