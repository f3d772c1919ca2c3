//! Cluster invariant auditor: quiescent-only, first client only.
//!
//! Independent checks over the whole cluster: drained queues, no duplicate
//! replica addresses, the configured storage engine everywhere, storage on
//! every storage-class worker, no orphan on-disk stores, a worker roster
//! that matches the simulation's process table, and every singleton role
//! filled by a process whose declared class is the best available fit.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use lattice_cluster::map::decode_replica_descriptor;
use lattice_cluster::process::{best_available_fitness, Fitness};
use lattice_cluster::rpc::reply_within;
use lattice_cluster::{
    keys, ClusterConfig, ClusterRole, ProcessClass, ReplicaEndpoint, ReplicaId, TransactionError,
    TransactionOption, WorkerEndpoint, WorkerFilter,
};

use crate::knobs;
use crate::round::{detail, CheckContext};

/// Run every quiescent-only audit, recording violations as they are found.
/// Only faults from collaborators propagate; audit failures do not abort.
pub(crate) async fn run_quiescent_checks(
    ctx: &mut CheckContext<'_>,
    config: &ClusterConfig,
) -> anyhow::Result<()> {
    let has_undesirable = check_undesirable_replicas(ctx, config).await?;

    let in_flight = ctx.feed.data_distribution_queue_bytes().await?;
    if in_flight > 0 {
        ctx.fail(
            "Non-zero data distribution queue/in-flight size",
            vec![detail("QueueSize", in_flight)],
        );
    }

    let max_log_queue = ctx.feed.max_log_queue_bytes().await?;
    if max_log_queue > knobs::MAX_LOG_QUEUE_BYTES {
        ctx.fail(
            "Non-zero log queue size",
            vec![detail("MaxQueueSize", max_log_queue)],
        );
    }

    match ctx.feed.max_replica_queue_bytes().await {
        Ok(max_replica_queue) => {
            if max_replica_queue > 0 {
                ctx.fail(
                    "Non-zero storage server queue size",
                    vec![detail("MaxQueueSize", max_replica_queue)],
                );
            }
        }
        Err(TransactionError::AttributeNotFound) => {
            tracing::warn!("could not read storage queue size");
            // Undesirable replicas make this gauge unreadable; in that case
            // the undesirable-server failure already covers it.
            if !has_undesirable {
                ctx.fail("Could not read storage queue size", Vec::new());
            }
        }
        Err(err) => return Err(err.into()),
    }

    check_storage_presence(ctx, config).await?;
    check_extra_data_stores(ctx).await?;

    if !check_role_fitness(ctx).await? {
        ctx.fail(
            "Cluster has process(es) not using requested classes",
            Vec::new(),
        );
    }

    if !check_worker_roster(ctx).await? {
        ctx.fail("Worker list incorrect", Vec::new());
    }

    Ok(())
}

/// Replicas sharing an address or running the wrong storage engine.
/// Returns whether any undesirable replica was found.
async fn check_undesirable_replicas(
    ctx: &mut CheckContext<'_>,
    config: &ClusterConfig,
) -> anyhow::Result<bool> {
    let replicas = storage_replicas(ctx).await?;

    for (index, replica) in replicas.iter().enumerate() {
        match reply_within(replica.rpc.get_store_type()).await {
            Err(err) => {
                ctx.fail(
                    "Storage server unavailable",
                    vec![detail("Replica", replica.id), detail("Error", err)],
                );
            }
            Ok(store_type) if store_type != config.desired_store_type => {
                ctx.fail(
                    "Storage server has wrong key-value store type",
                    vec![
                        detail("Replica", replica.id),
                        detail("StoreType", store_type),
                        detail("DesiredType", config.desired_store_type),
                    ],
                );
                return Ok(true);
            }
            Ok(_) => {}
        }

        for other in &replicas[index + 1..] {
            if replica.address == other.address {
                ctx.fail(
                    "Multiple storage servers have the same address",
                    vec![
                        detail("Replica1", replica.id),
                        detail("Replica2", other.id),
                        detail("Address", replica.address),
                    ],
                );
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Every non-excluded worker declared (or defaulting to) storage class must
/// actually host a replica.
async fn check_storage_presence(
    ctx: &mut CheckContext<'_>,
    config: &ClusterConfig,
) -> anyhow::Result<()> {
    let workers = ctx.feed.workers(WorkerFilter::All).await?;
    let replicas = storage_replicas(ctx).await?;
    let replica_addresses: BTreeSet<SocketAddr> =
        replicas.iter().map(|replica| replica.address).collect();

    for worker in &workers {
        let wants_storage =
            matches!(worker.class, ProcessClass::Storage | ProcessClass::Unset);
        if wants_storage
            && !config.is_excluded(worker.address)
            && !replica_addresses.contains(&worker.address)
        {
            ctx.fail(
                "No storage server on worker",
                vec![detail("Address", worker.address)],
            );
            return Ok(());
        }
    }
    Ok(())
}

/// On-disk stores no live replica or transaction log accounts for. Orphans
/// get their owning process rebooted in simulation so recovery can clean
/// them up, and fail the round either way.
async fn check_extra_data_stores(ctx: &mut CheckContext<'_>) -> anyhow::Result<()> {
    let workers = ctx.feed.workers(WorkerFilter::All).await?;
    let replicas = storage_replicas(ctx).await?;

    let mut stateful: BTreeMap<SocketAddr, BTreeSet<ReplicaId>> = BTreeMap::new();
    for replica in &replicas {
        stateful.entry(replica.address).or_default().insert(replica.id);
    }
    for (address, id) in ctx.feed.log_stores() {
        stateful.entry(address).or_default().insert(id);
    }

    let mut found_orphan = false;
    for worker in &workers {
        let stores = match reply_within(worker.rpc.disk_stores()).await {
            Ok(stores) => stores,
            Err(err) => {
                ctx.fail(
                    "Failed to get data stores",
                    vec![detail("Address", worker.address), detail("Error", err)],
                );
                return Ok(());
            }
        };
        for id in stores {
            let live = stateful
                .get(&worker.address)
                .map(|ids| ids.contains(&id))
                .unwrap_or(false);
            if !live {
                tracing::warn!(address = %worker.address, store = %id, "orphan data store");
                if ctx.sim.is_simulated() {
                    tracing::warn!(address = %worker.address, store = %id, "requesting process reboot");
                    ctx.sim.reboot(worker.address);
                }
                found_orphan = true;
            }
        }
    }

    if found_orphan {
        ctx.fail("Extra data stores present on workers", Vec::new());
    }
    Ok(())
}

/// Cross-check the worker roster against the simulation's process table.
/// Trivially true outside simulation, where no second source of truth
/// exists.
async fn check_worker_roster(ctx: &mut CheckContext<'_>) -> anyhow::Result<bool> {
    if !ctx.sim.is_simulated() {
        return Ok(true);
    }
    let workers = ctx.feed.workers(WorkerFilter::All).await?;

    let mut roster = BTreeSet::new();
    for worker in &workers {
        match ctx.sim.process_at(worker.address) {
            Some(process) if !process.failed => {
                roster.insert(worker.address);
            }
            _ => {
                tracing::warn!(address = %worker.address, "dead or unknown worker in list");
                return Ok(false);
            }
        }
    }

    for process in ctx.sim.processes() {
        let expected = process.reliable
            && process.name == "Server"
            && process.class != ProcessClass::Tester;
        if expected && !roster.contains(&process.address) {
            tracing::warn!(address = %process.address, "process missing from worker list");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Every singleton role must be held by a process whose class fitness equals
/// the best fitness available among non-excluded workers. The master may
/// fall back to an excluded worker when nothing else qualifies.
async fn check_role_fitness(ctx: &mut CheckContext<'_>) -> anyhow::Result<bool> {
    let all_workers = ctx.feed.workers(WorkerFilter::All).await?;
    let non_excluded = ctx.feed.workers(WorkerFilter::NonExcluded).await?;
    let roles = ctx.feed.roles();

    let all_classes: BTreeMap<SocketAddr, ProcessClass> = class_map(&all_workers);
    let usable_classes: BTreeMap<SocketAddr, ProcessClass> = class_map(&non_excluded);

    // Cluster controller.
    let best = best_available_fitness(usable_classes.values().copied(), ClusterRole::ClusterController);
    if !role_has_fitness(
        &usable_classes,
        roles.cluster_controller,
        ClusterRole::ClusterController,
        best,
    ) {
        tracing::warn!(best = ?best, "cluster controller is not the best available fit");
        return Ok(false);
    }

    // Master, with the exclusion fallback.
    let mut best_master =
        best_available_fitness(usable_classes.values().copied(), ClusterRole::Master);
    let mut allow_excluded_master = false;
    if best_master == Fitness::NeverAssign {
        let fallback = best_available_fitness(all_classes.values().copied(), ClusterRole::Master);
        if fallback != Fitness::NeverAssign {
            best_master = fallback;
            allow_excluded_master = true;
        }
    }
    let master_ok = match roles.master {
        None => false,
        Some(address) => match (usable_classes.get(&address), all_classes.get(&address)) {
            (Some(class), _) => class.fitness_for(ClusterRole::Master) == best_master,
            (None, Some(class)) if allow_excluded_master => {
                class.fitness_for(ClusterRole::Master) == best_master
            }
            _ => false,
        },
    };
    if !master_ok {
        tracing::warn!(best = ?best_master, "master is not the best available fit");
        return Ok(false);
    }

    // Routing nodes.
    let best = best_available_fitness(usable_classes.values().copied(), ClusterRole::Proxy);
    for proxy in &roles.proxies {
        if !role_has_fitness(&usable_classes, Some(*proxy), ClusterRole::Proxy, best) {
            tracing::warn!(address = %proxy, best = ?best, "routing node is not the best available fit");
            return Ok(false);
        }
    }

    // Resolvers.
    let best = best_available_fitness(usable_classes.values().copied(), ClusterRole::Resolver);
    for resolver in &roles.resolvers {
        if !role_has_fitness(&usable_classes, Some(*resolver), ClusterRole::Resolver, best) {
            tracing::warn!(address = %resolver, best = ?best, "resolver is not the best available fit");
            return Ok(false);
        }
    }

    Ok(true)
}

fn class_map(workers: &[WorkerEndpoint]) -> BTreeMap<SocketAddr, ProcessClass> {
    workers
        .iter()
        .map(|worker| (worker.address, worker.class))
        .collect()
}

fn role_has_fitness(
    classes: &BTreeMap<SocketAddr, ProcessClass>,
    holder: Option<SocketAddr>,
    role: ClusterRole,
    best: Fitness,
) -> bool {
    match holder.and_then(|address| classes.get(&address)) {
        Some(class) => class.fitness_for(role) == best,
        None => false,
    }
}

/// Every replica in the replica directory, resolved to live endpoints.
async fn storage_replicas(ctx: &mut CheckContext<'_>) -> anyhow::Result<Vec<ReplicaEndpoint>> {
    let mut tr = ctx.db.transaction();
    tr.set_option(TransactionOption::LockAware);
    loop {
        match tr
            .get_range(keys::server_list_range(), knobs::SERVER_LIST_ROW_LIMIT)
            .await
        {
            Ok(result) => {
                let mut replicas = Vec::with_capacity(result.entries.len());
                for entry in &result.entries {
                    let descriptor = decode_replica_descriptor(&entry.value)?;
                    replicas.push(ctx.feed.connect(&descriptor));
                }
                return Ok(replicas);
            }
            Err(err) => tr.on_error(err).await?,
        }
    }
}
