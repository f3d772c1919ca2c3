//! Shared in-memory cluster for integration tests.
//!
//! Implements every `lattice_cluster` seam over plain maps: replicas serve
//! paged snapshot reads from their own copy of the data, routing nodes
//! answer shard-location queries from the canonical shard list, and the
//! "transactional client" reads the canonical system tables directly. Tests
//! inject faults by flipping per-endpoint switches.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lattice_cluster::keys::{self, ALL_KEYS_END, USER_KEYS_END};
use lattice_cluster::map::{
    encode_replica_descriptor, encode_shard_teams, ReplicaDescriptor, ShardTeams,
};
use lattice_cluster::metrics::{sampled_bytes, StorageMetrics};
use lattice_cluster::rpc::{
    GetKeyServerLocationsReply, GetKeyServerLocationsRequest, GetKeyValuesReply,
    GetKeyValuesRequest, ShardAssignment, WaitMetricsRequest,
};
use lattice_cluster::{
    ClusterFeed, Database, KeyRange, KeyValue, ProcessClass, RangeResult, ReplicaEndpoint,
    ReplicaId, RoleAssignments, RoutingNode, RoutingRpc, RpcError, SimProcess, Simulator,
    StorageRpc, StoreType, Transaction, TransactionError, TransactionOption, Version,
    WorkerFilter, WorkerRpc,
};

/// One simulated storage replica.
pub struct SimReplica {
    pub id: ReplicaId,
    pub address: SocketAddr,
    store_type: Mutex<StoreType>,
    reachable: AtomicBool,
    /// Added to every size estimate this replica reports.
    estimate_bias: AtomicI64,
    /// When non-zero, caps rows per page below the request limit.
    page_row_cap: AtomicUsize,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl SimReplica {
    fn new(id: ReplicaId, address: SocketAddr, store_type: StoreType) -> Arc<Self> {
        Arc::new(Self {
            id,
            address,
            store_type: Mutex::new(store_type),
            reachable: AtomicBool::new(true),
            estimate_bias: AtomicI64::new(0),
            page_row_cap: AtomicUsize::new(0),
            data: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_estimate_bias(&self, bias: i64) {
        self.estimate_bias.store(bias, Ordering::SeqCst);
    }

    pub fn set_page_row_cap(&self, cap: usize) {
        self.page_row_cap.store(cap, Ordering::SeqCst);
    }

    pub fn set_store_type(&self, store_type: StoreType) {
        *self.store_type.lock().unwrap() = store_type;
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.data.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &[u8]) {
        self.data.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl StorageRpc for SimReplica {
    async fn get_key_values(
        &self,
        req: GetKeyValuesRequest,
    ) -> Result<GetKeyValuesReply, RpcError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable);
        }
        let cap = self.page_row_cap.load(Ordering::SeqCst);
        let row_limit = if cap > 0 { req.limit.min(cap) } else { req.limit };

        let data = self.data.lock().unwrap();
        let mut page = Vec::new();
        let mut bytes = 0usize;
        let mut more = false;
        for (key, value) in data.range(req.range.begin.clone()..req.range.end.clone()) {
            if page.len() >= row_limit || bytes >= req.limit_bytes {
                more = true;
                break;
            }
            bytes += key.len() + value.len();
            page.push(KeyValue::new(key.clone(), value.clone()));
        }
        Ok(GetKeyValuesReply { data: page, more })
    }

    async fn wait_metrics(&self, req: WaitMetricsRequest) -> Result<StorageMetrics, RpcError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable);
        }
        let data = self.data.lock().unwrap();
        let total = sampled_bytes(
            data.range(req.keys.begin.clone()..req.keys.end.clone())
                .map(|(key, value)| (key.as_slice(), value.as_slice())),
        );
        Ok(StorageMetrics {
            bytes: total + self.estimate_bias.load(Ordering::SeqCst),
        })
    }

    async fn get_store_type(&self) -> Result<StoreType, RpcError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable);
        }
        Ok(*self.store_type.lock().unwrap())
    }
}

/// One simulated routing node answering from the canonical shard list.
pub struct SimRoutingNode {
    pub id: u64,
    pub address: SocketAddr,
    reachable: AtomicBool,
    cluster: Arc<ClusterInner>,
}

impl SimRoutingNode {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoutingRpc for SimRoutingNode {
    async fn get_key_server_locations(
        &self,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply, RpcError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable);
        }

        // The shard-map table is itself sharded at every boundary; each
        // sub-range is served by the replicas of the shard that stores it.
        let shards = self.cluster.shards.lock().unwrap().clone();
        let mut results = Vec::new();
        let boundaries: Vec<Vec<u8>> = shards
            .iter()
            .map(|shard| shard.range.begin.clone())
            .chain(std::iter::once(ALL_KEYS_END.to_vec()))
            .collect();
        for pair in boundaries.windows(2) {
            let begin = keys::key_servers_key(&pair[0]);
            let end = keys::key_servers_key(&pair[1]);
            if end <= req.begin || begin >= req.end {
                continue;
            }
            if results.len() >= req.limit {
                break;
            }
            let clipped = KeyRange::new(begin.max(req.begin.clone()), end.min(req.end.clone()));
            let owner = self
                .cluster
                .shard_containing(&clipped.begin)
                .expect("shard map key outside every shard");
            let replicas = self.cluster.endpoints(&owner.teams.sources);
            results.push(ShardAssignment {
                range: clipped,
                replicas,
            });
        }
        Ok(GetKeyServerLocationsReply { results })
    }
}

/// One simulated worker process.
pub struct SimWorker {
    pub address: SocketAddr,
    pub class: ProcessClass,
    reachable: AtomicBool,
    disk_stores: Mutex<Vec<ReplicaId>>,
}

impl SimWorker {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn add_disk_store(&self, id: ReplicaId) {
        self.disk_stores.lock().unwrap().push(id);
    }
}

#[async_trait]
impl WorkerRpc for SimWorker {
    async fn disk_stores(&self) -> Result<Vec<ReplicaId>, RpcError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable);
        }
        Ok(self.disk_stores.lock().unwrap().clone())
    }
}

/// One shard of the canonical shard list.
#[derive(Clone, Debug)]
pub struct SimShard {
    pub range: KeyRange,
    pub teams: ShardTeams,
}

struct ClusterInner {
    version: AtomicI64,
    replicas: Mutex<BTreeMap<ReplicaId, Arc<SimReplica>>>,
    shards: Mutex<Vec<SimShard>>,
    /// Canonical system tables (configuration, replica directory).
    system: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    routing: Mutex<Vec<Arc<SimRoutingNode>>>,
    routing_changed: tokio::sync::Notify,
    workers: Mutex<Vec<Arc<SimWorker>>>,
    log_stores: Mutex<Vec<(SocketAddr, ReplicaId)>>,
    roles: Mutex<RoleAssignments>,
    excluded: Mutex<BTreeSet<SocketAddr>>,
    dd_queue: Mutex<Result<i64, TransactionError>>,
    log_queue: Mutex<Result<i64, TransactionError>>,
    replica_queue: Mutex<Result<i64, TransactionError>>,
    simulated: bool,
    processes: Mutex<Vec<SimProcess>>,
    rebooted: Mutex<Vec<SocketAddr>>,
    time_keeper_enabled: AtomicBool,
}

impl ClusterInner {
    fn shard_containing(&self, key: &[u8]) -> Option<SimShard> {
        self.shards
            .lock()
            .unwrap()
            .iter()
            .find(|shard| shard.range.contains(key))
            .cloned()
    }

    fn endpoints(&self, ids: &[ReplicaId]) -> Vec<ReplicaEndpoint> {
        let replicas = self.replicas.lock().unwrap();
        ids.iter()
            .filter_map(|id| replicas.get(id))
            .map(|replica| ReplicaEndpoint {
                id: replica.id,
                address: replica.address,
                rpc: replica.clone() as Arc<dyn StorageRpc>,
            })
            .collect()
    }
}

/// Handle to the simulated cluster; implements every collaborator seam.
#[derive(Clone)]
pub struct SimCluster {
    inner: Arc<ClusterInner>,
}

impl SimCluster {
    pub fn builder(team_size: usize) -> SimClusterBuilder {
        SimClusterBuilder::new(team_size)
    }

    pub fn replica(&self, id: u64) -> Arc<SimReplica> {
        self.inner
            .replicas
            .lock()
            .unwrap()
            .get(&ReplicaId(id))
            .expect("unknown replica id")
            .clone()
    }

    pub fn routing_node(&self, id: u64) -> Arc<SimRoutingNode> {
        self.inner
            .routing
            .lock()
            .unwrap()
            .iter()
            .find(|node| node.id == id)
            .expect("unknown routing node id")
            .clone()
    }

    pub fn worker(&self, address: SocketAddr) -> Arc<SimWorker> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .find(|worker| worker.address == address)
            .expect("unknown worker address")
            .clone()
    }

    /// Write a user pair to every replica of the shard that owns the key.
    pub fn set_value(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        let shard = self
            .inner
            .shards
            .lock()
            .unwrap()
            .iter()
            .find(|shard| shard.range.contains(&key))
            .cloned()
            .expect("key outside every shard");
        let replicas = self.inner.replicas.lock().unwrap();
        for id in shard.teams.sources.iter().chain(&shard.teams.destinations) {
            if let Some(replica) = replicas.get(id) {
                replica.insert(key.clone(), value.clone());
            }
        }
    }

    /// Per-replica divergence injection.
    pub fn set_value_on(&self, id: u64, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.replica(id).insert(key, value);
    }

    pub fn set_dd_queue(&self, value: Result<i64, TransactionError>) {
        *self.inner.dd_queue.lock().unwrap() = value;
    }

    pub fn set_log_queue(&self, value: Result<i64, TransactionError>) {
        *self.inner.log_queue.lock().unwrap() = value;
    }

    pub fn set_replica_queue(&self, value: Result<i64, TransactionError>) {
        *self.inner.replica_queue.lock().unwrap() = value;
    }

    pub fn set_roles(&self, roles: RoleAssignments) {
        *self.inner.roles.lock().unwrap() = roles;
    }

    pub fn roles(&self) -> RoleAssignments {
        self.inner.roles.lock().unwrap().clone()
    }

    pub fn add_log_store(&self, address: SocketAddr, id: ReplicaId) {
        self.inner.log_stores.lock().unwrap().push((address, id));
    }

    pub fn add_process(&self, process: SimProcess) {
        self.inner.processes.lock().unwrap().push(process);
    }

    pub fn rebooted(&self) -> Vec<SocketAddr> {
        self.inner.rebooted.lock().unwrap().clone()
    }

    pub fn time_keeper_enabled(&self) -> bool {
        self.inner.time_keeper_enabled.load(Ordering::SeqCst)
    }

    /// Wake anyone racing a fan-out against a routing-set change.
    pub fn notify_routing_changed(&self) {
        self.inner.routing_changed.notify_waiters();
    }
}

#[async_trait]
impl Database for SimCluster {
    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(SimTransaction {
            inner: self.inner.clone(),
        })
    }

    async fn wait_quiescent(&self) -> Result<(), TransactionError> {
        Ok(())
    }

    async fn set_time_keeper(&self, enabled: bool) -> Result<(), TransactionError> {
        self.inner
            .time_keeper_enabled
            .store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

struct SimTransaction {
    inner: Arc<ClusterInner>,
}

#[async_trait]
impl Transaction for SimTransaction {
    fn set_option(&mut self, _option: TransactionOption) {}

    async fn get_read_version(&mut self) -> Result<Version, TransactionError> {
        Ok(Version(self.inner.version.load(Ordering::SeqCst)))
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TransactionError> {
        Ok(self.inner.system.lock().unwrap().get(key).cloned())
    }

    async fn get_range(
        &mut self,
        range: KeyRange,
        limit: usize,
    ) -> Result<RangeResult, TransactionError> {
        let system = self.inner.system.lock().unwrap();
        let mut entries = Vec::new();
        let mut more = false;
        for (key, value) in system.range(range.begin.clone()..range.end.clone()) {
            if entries.len() >= limit {
                more = true;
                break;
            }
            entries.push(KeyValue::new(key.clone(), value.clone()));
        }
        Ok(RangeResult { entries, more })
    }

    async fn get_storage_metrics(
        &mut self,
        range: KeyRange,
    ) -> Result<StorageMetrics, TransactionError> {
        // Sum each shard once, through its first source replica.
        let shards = self.inner.shards.lock().unwrap().clone();
        let replicas = self.inner.replicas.lock().unwrap();
        let mut bytes = 0i64;
        for shard in &shards {
            let Some(replica) = shard
                .teams
                .sources
                .first()
                .and_then(|id| replicas.get(id))
            else {
                continue;
            };
            let begin = shard.range.begin.clone().max(range.begin.clone());
            let end = shard.range.end.clone().min(range.end.clone());
            if begin >= end {
                continue;
            }
            let data = replica.data.lock().unwrap();
            bytes += data
                .range(begin..end)
                .map(|(key, value)| (key.len() + value.len()) as i64)
                .sum::<i64>();
        }
        Ok(StorageMetrics { bytes })
    }

    async fn on_error(&mut self, error: TransactionError) -> Result<(), TransactionError> {
        if error.is_retryable() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        } else {
            Err(error)
        }
    }
}

#[async_trait]
impl ClusterFeed for SimCluster {
    async fn routing_nodes(&self) -> Vec<RoutingNode> {
        self.inner
            .routing
            .lock()
            .unwrap()
            .iter()
            .map(|node| RoutingNode {
                id: node.id,
                address: node.address,
                rpc: node.clone() as Arc<dyn RoutingRpc>,
            })
            .collect()
    }

    async fn routing_changed(&self) {
        self.inner.routing_changed.notified().await;
    }

    async fn workers(
        &self,
        filter: WorkerFilter,
    ) -> Result<Vec<lattice_cluster::WorkerEndpoint>, TransactionError> {
        let excluded = self.inner.excluded.lock().unwrap().clone();
        Ok(self
            .inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|worker| {
                filter == WorkerFilter::All || !excluded.contains(&worker.address)
            })
            .map(|worker| lattice_cluster::WorkerEndpoint {
                address: worker.address,
                class: worker.class,
                rpc: worker.clone() as Arc<dyn WorkerRpc>,
            })
            .collect())
    }

    fn log_stores(&self) -> Vec<(SocketAddr, ReplicaId)> {
        self.inner.log_stores.lock().unwrap().clone()
    }

    fn roles(&self) -> RoleAssignments {
        self.inner.roles.lock().unwrap().clone()
    }

    fn connect(&self, descriptor: &ReplicaDescriptor) -> ReplicaEndpoint {
        let replicas = self.inner.replicas.lock().unwrap();
        let replica = replicas
            .get(&descriptor.id)
            .expect("directory entry for unknown replica");
        ReplicaEndpoint {
            id: replica.id,
            address: descriptor.address,
            rpc: replica.clone() as Arc<dyn StorageRpc>,
        }
    }

    async fn data_distribution_queue_bytes(&self) -> Result<i64, TransactionError> {
        self.inner.dd_queue.lock().unwrap().clone()
    }

    async fn max_log_queue_bytes(&self) -> Result<i64, TransactionError> {
        self.inner.log_queue.lock().unwrap().clone()
    }

    async fn max_replica_queue_bytes(&self) -> Result<i64, TransactionError> {
        self.inner.replica_queue.lock().unwrap().clone()
    }
}

impl Simulator for SimCluster {
    fn is_simulated(&self) -> bool {
        self.inner.simulated
    }

    fn processes(&self) -> Vec<SimProcess> {
        self.inner.processes.lock().unwrap().clone()
    }

    fn process_at(&self, address: SocketAddr) -> Option<SimProcess> {
        self.inner
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|process| process.address == address)
            .cloned()
    }

    fn reboot(&self, address: SocketAddr) {
        self.inner.rebooted.lock().unwrap().push(address);
    }
}

/// Declarative cluster assembly for tests.
pub struct SimClusterBuilder {
    team_size: usize,
    store_type: StoreType,
    simulated: bool,
    replicas: Vec<(u64, SocketAddr)>,
    shards: Vec<(Vec<u8>, Vec<u8>, Vec<u64>, Vec<u64>)>,
    excluded: Vec<SocketAddr>,
    extra_workers: Vec<(SocketAddr, ProcessClass)>,
}

/// Address of the default control-plane worker (routing node + roles).
pub fn control_address() -> SocketAddr {
    "10.0.0.100:4500".parse().unwrap()
}

pub fn replica_address(id: u64) -> SocketAddr {
    format!("10.0.0.{id}:4500").parse().unwrap()
}

impl SimClusterBuilder {
    pub fn new(team_size: usize) -> Self {
        Self {
            team_size,
            store_type: StoreType::Memory,
            simulated: true,
            replicas: Vec::new(),
            shards: Vec::new(),
            excluded: Vec::new(),
            extra_workers: Vec::new(),
        }
    }

    pub fn store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    pub fn not_simulated(mut self) -> Self {
        self.simulated = false;
        self
    }

    pub fn replica(mut self, id: u64) -> Self {
        self.replicas.push((id, replica_address(id)));
        self
    }

    pub fn replica_at(mut self, id: u64, address: &str) -> Self {
        self.replicas.push((id, address.parse().unwrap()));
        self
    }

    /// A user-space shard `[begin, end)` served by `sources`.
    pub fn shard(mut self, begin: &[u8], end: &[u8], sources: &[u64]) -> Self {
        self.shards
            .push((begin.to_vec(), end.to_vec(), sources.to_vec(), Vec::new()));
        self
    }

    /// A shard in motion: served by `sources`, headed to `destinations`.
    pub fn relocating_shard(
        mut self,
        begin: &[u8],
        end: &[u8],
        sources: &[u64],
        destinations: &[u64],
    ) -> Self {
        self.shards.push((
            begin.to_vec(),
            end.to_vec(),
            sources.to_vec(),
            destinations.to_vec(),
        ));
        self
    }

    pub fn exclude(mut self, address: SocketAddr) -> Self {
        self.excluded.push(address);
        self
    }

    pub fn extra_worker(mut self, address: &str, class: ProcessClass) -> Self {
        self.extra_workers.push((address.parse().unwrap(), class));
        self
    }

    pub fn build(self) -> SimCluster {
        let mut replicas = BTreeMap::new();
        for (id, address) in &self.replicas {
            replicas.insert(
                ReplicaId(*id),
                SimReplica::new(ReplicaId(*id), *address, self.store_type),
            );
        }

        // Canonical shard list: the declared user shards plus one system
        // shard holding the shard map and directory tables.
        let mut shards: Vec<SimShard> = self
            .shards
            .iter()
            .map(|(begin, end, sources, destinations)| SimShard {
                range: KeyRange::new(begin.clone(), end.clone()),
                teams: ShardTeams {
                    sources: sources.iter().map(|id| ReplicaId(*id)).collect(),
                    destinations: destinations.iter().map(|id| ReplicaId(*id)).collect(),
                },
            })
            .collect();
        let system_sources: Vec<ReplicaId> = self
            .replicas
            .iter()
            .take(self.team_size)
            .map(|(id, _)| ReplicaId(*id))
            .collect();
        shards.push(SimShard {
            range: KeyRange::new(USER_KEYS_END, ALL_KEYS_END),
            teams: ShardTeams {
                sources: system_sources.clone(),
                destinations: Vec::new(),
            },
        });

        // The shard-map table: one boundary entry per shard plus a sentinel.
        let mut map_entries: Vec<(Vec<u8>, Vec<u8>)> = shards
            .iter()
            .map(|shard| {
                (
                    keys::key_servers_key(&shard.range.begin),
                    encode_shard_teams(&shard.teams),
                )
            })
            .collect();
        map_entries.push((keys::key_servers_key(ALL_KEYS_END), Vec::new()));

        // Canonical system tables, served through the transactional seam.
        let mut system = BTreeMap::new();
        let config_key = |name: &str| {
            let mut key = keys::CONFIG_PREFIX.to_vec();
            key.extend_from_slice(name.as_bytes());
            key
        };
        system.insert(
            config_key("storage_team_size"),
            self.team_size.to_string().into_bytes(),
        );
        system.insert(
            config_key("storage_engine"),
            self.store_type.to_string().into_bytes(),
        );
        for address in &self.excluded {
            system.insert(config_key(&format!("excluded/{address}")), Vec::new());
        }
        for (id, address) in &self.replicas {
            system.insert(
                keys::server_list_key(*id),
                encode_replica_descriptor(&ReplicaDescriptor {
                    id: ReplicaId(*id),
                    address: *address,
                }),
            );
        }

        // System tables also live on the replicas of the system shard, so
        // the shard map can be read back through the storage protocol.
        for (key, value) in &map_entries {
            for id in &system_sources {
                if let Some(replica) = replicas.get(id) {
                    replica.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &system {
            for id in &system_sources {
                if let Some(replica) = replicas.get(id) {
                    replica.insert(key.clone(), value.clone());
                }
            }
        }

        // One worker per replica, plus a stateless control-plane worker that
        // fills every singleton role and hosts the routing node.
        let mut workers: Vec<Arc<SimWorker>> = Vec::new();
        for (id, address) in &self.replicas {
            workers.push(Arc::new(SimWorker {
                address: *address,
                class: ProcessClass::Storage,
                reachable: AtomicBool::new(true),
                disk_stores: Mutex::new(vec![ReplicaId(*id)]),
            }));
        }
        workers.push(Arc::new(SimWorker {
            address: control_address(),
            class: ProcessClass::Stateless,
            reachable: AtomicBool::new(true),
            disk_stores: Mutex::new(Vec::new()),
        }));
        for (address, class) in &self.extra_workers {
            workers.push(Arc::new(SimWorker {
                address: *address,
                class: *class,
                reachable: AtomicBool::new(true),
                disk_stores: Mutex::new(Vec::new()),
            }));
        }

        let processes = workers
            .iter()
            .map(|worker| SimProcess {
                address: worker.address,
                name: "Server".to_string(),
                class: worker.class,
                reliable: true,
                failed: false,
            })
            .collect();

        let roles = RoleAssignments {
            cluster_controller: Some(control_address()),
            master: Some(control_address()),
            proxies: vec![control_address()],
            resolvers: vec![control_address()],
        };

        let inner = Arc::new(ClusterInner {
            version: AtomicI64::new(1),
            replicas: Mutex::new(replicas),
            shards: Mutex::new(shards),
            system: Mutex::new(system),
            routing: Mutex::new(Vec::new()),
            routing_changed: tokio::sync::Notify::new(),
            workers: Mutex::new(workers),
            log_stores: Mutex::new(Vec::new()),
            roles: Mutex::new(roles),
            excluded: Mutex::new(self.excluded.into_iter().collect()),
            dd_queue: Mutex::new(Ok(0)),
            log_queue: Mutex::new(Ok(0)),
            replica_queue: Mutex::new(Ok(0)),
            simulated: self.simulated,
            processes: Mutex::new(processes),
            rebooted: Mutex::new(Vec::new()),
            time_keeper_enabled: AtomicBool::new(true),
        });

        let routing = Arc::new(SimRoutingNode {
            id: 1,
            address: control_address(),
            reachable: AtomicBool::new(true),
            cluster: inner.clone(),
        });
        inner.routing.lock().unwrap().push(routing);

        SimCluster { inner }
    }
}

/// Route engine logs through `RUST_LOG` when a test needs them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Add a second routing node sharing the canonical view.
pub fn add_routing_node(cluster: &SimCluster, id: u64, address: &str) -> Arc<SimRoutingNode> {
    let node = Arc::new(SimRoutingNode {
        id,
        address: address.parse().unwrap(),
        reachable: AtomicBool::new(true),
        cluster: cluster.inner.clone(),
    });
    cluster.inner.routing.lock().unwrap().push(node.clone());
    node
}
