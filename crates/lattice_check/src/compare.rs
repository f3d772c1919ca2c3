//! Replica comparator: streaming equality and size validation per shard.
//!
//! For every shard this client is responsible for, stream the shard's
//! contents from all of its replicas in lockstep at a common snapshot
//! version and compare byte for byte, while accumulating the byte-sample
//! statistics needed to validate each replica's own size estimate.

use futures_util::future::join_all;
use lattice_cluster::keys::{self, KEY_SERVERS_PREFIX};
use lattice_cluster::map::{decode_replica_descriptor, decode_shard_teams};
use lattice_cluster::metrics::{self, ShardSizeBounds};
use lattice_cluster::rpc::{reply_within, GetKeyValuesRequest, WaitMetricsRequest};
use lattice_cluster::{
    ClusterConfig, Database, KeyRange, KeyValue, ReplicaEndpoint, ReplicaId, RpcError,
    TransactionError, TransactionOption,
};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::knobs;
use crate::locations::transaction_fault;
use crate::oracle;
use crate::rate_gate::RateGate;
use crate::round::{detail, CheckContext};

/// Check that every shard holds identical data on all of its replicas and
/// that replica size estimates are accurate. Returns `false` when the round
/// was aborted by a violation.
pub(crate) async fn check_data_consistency(
    ctx: &mut CheckContext<'_>,
    key_locations: &[KeyValue],
    config: &ClusterConfig,
) -> anyhow::Result<bool> {
    if key_locations.len() < 2 {
        return Ok(true);
    }

    let mut rate_gate = RateGate::new(ctx.options.rate_limit, knobs::RATE_WINDOW_SECONDS);

    // Measuring the database reads every shard boundary, which is only
    // affordable in simulation.
    let db_size = if ctx.sim.is_simulated() {
        database_size(ctx.db).await? as f64
    } else {
        knobs::UNSIMULATED_DB_SIZE
    };
    let max_shard = metrics::max_shard_size(db_size);

    let ranges: Vec<KeyRange> = key_locations
        .windows(2)
        .map(|pair| KeyRange::new(pair[0].key.clone(), pair[1].key.clone()))
        .collect();

    let shuffle_seed = ctx.options.shuffle_shards.then_some(ctx.shuffle_seed);
    let visits = shard_schedule(
        ctx.client_id,
        ctx.client_count,
        ctx.options.distributed,
        ctx.options.shard_sample_factor,
        ranges.len(),
        shuffle_seed,
    );

    for visit in visits {
        let range = ranges[visit.shard].clone();
        if !check_shard(ctx, &mut rate_gate, &key_locations[visit.shard], &range, visit, config, max_shard).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One scheduled shard visit. A visit without `full_check` only collects the
/// shard's size estimates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ShardVisit {
    pub shard: usize,
    pub full_check: bool,
}

/// Deterministic partition of shards across distributed clients.
///
/// Client `k` starts at `k * (factor + 1)` and strides by
/// `clients * factor`, except the first client, which visits every shard but
/// fully checks only those whose (shuffled) index is a multiple of
/// `clients * factor`. The shuffle is seeded identically on every client, so
/// they agree on the permutation without talking to each other.
pub(crate) fn shard_schedule(
    client_id: usize,
    client_count: usize,
    distributed: bool,
    shard_sample_factor: usize,
    shard_count: usize,
    shuffle_seed: Option<u64>,
) -> Vec<ShardVisit> {
    let effective_clients = if distributed { client_count.max(1) } else { 1 };
    let first_client = client_id == 0;
    let factor = shard_sample_factor.max(1);

    let mut order: Vec<usize> = (0..shard_count).collect();
    if let Some(seed) = shuffle_seed {
        let mut rng = SmallRng::seed_from_u64(if seed == 0 { 1 } else { seed });
        order.shuffle(&mut rng);
    }

    let stride = if distributed && !first_client {
        effective_clients * factor
    } else {
        1
    };

    let mut visits = Vec::new();
    let mut index = client_id * (factor + 1);
    while index < shard_count {
        let shard = order[index];
        let full_check = !first_client || shard % (effective_clients * factor) == 0;
        visits.push(ShardVisit { shard, full_check });
        index += stride;
    }
    visits
}

/// Per-shard accumulators, merged into the round when the shard completes.
#[derive(Debug, Default)]
struct ShardStats {
    shard_keys: usize,
    shard_bytes: i64,
    sampled_bytes: i64,
    split_bytes: i64,
    first_key_sampled_bytes: i64,
    sampled_keys: usize,
    variance: f64,
    can_split: bool,
    bytes_read: i64,
}

#[allow(clippy::too_many_arguments)]
async fn check_shard(
    ctx: &mut CheckContext<'_>,
    rate_gate: &mut RateGate,
    location: &KeyValue,
    range: &KeyRange,
    visit: ShardVisit,
    config: &ClusterConfig,
    max_shard: i64,
) -> anyhow::Result<bool> {
    let teams = decode_shard_teams(&location.value)?;
    let is_relocating = !teams.destinations.is_empty();

    if ctx.first_client() && ctx.quiescent && is_relocating {
        // Data distribution is paused for the check, so shards caught with
        // in-flight destinations are expected; the old "no relocations while
        // quiescent" failure stays disabled.
        tracing::debug!(shard = %range, "shard still has relocation destinations");
    }

    if ctx.first_client() && ctx.quiescent && teams.sources.len() != config.storage_team_size {
        ctx.fail(
            "Invalid team size",
            vec![
                detail("ShardBegin", keys::printable(&range.begin)),
                detail("ShardEnd", keys::printable(&range.end)),
                detail("TeamSize", teams.sources.len()),
                detail("DesiredTeamSize", config.storage_team_size),
            ],
        );
        return Ok(false);
    }

    // A relocating shard is judged by where the data is headed.
    let replica_ids = if is_relocating {
        &teams.destinations
    } else {
        &teams.sources
    };
    let team = resolve_team(ctx, replica_ids).await?;

    let estimates = storage_size_estimates(&team, range).await;
    let bounds = metrics::shard_size_bounds(range, max_shard);

    if ctx.first_client() {
        if ctx.quiescent && estimates.is_empty() {
            ctx.fail(
                "Error fetching storage metrics",
                vec![
                    detail("ShardBegin", keys::printable(&range.begin)),
                    detail("ShardEnd", keys::printable(&range.end)),
                ],
            );
        } else if ctx.options.distributed {
            // Distributed rounds approximate per-replica totals from the
            // shard estimates; the full sums live on the other clients.
            for (index, endpoint) in team.iter().enumerate() {
                let estimate = estimates.get(index).copied().unwrap_or(-1);
                *ctx.stats.replica_bytes.entry(endpoint.id).or_default() += estimate.max(0);
            }
        }
    }

    if !visit.full_check {
        return Ok(true);
    }

    let Some(stats) = stream_and_compare(ctx, rate_gate, range, &team, is_relocating, &bounds)
        .await?
    else {
        return Ok(false);
    };

    if !ctx.options.distributed {
        for endpoint in &team {
            *ctx.stats.replica_bytes.entry(endpoint.id).or_default() += stats.shard_bytes;
        }
    }

    // Every replica's own sampled estimate must match the sample we just
    // recomputed from its data.
    if ctx.quiescent {
        for (index, estimate) in estimates.iter().enumerate() {
            if *estimate >= 0 && *estimate != stats.sampled_bytes {
                ctx.fail(
                    "Storage servers had incorrect sampled estimate",
                    vec![
                        detail("EstimatedBytes", estimate),
                        detail("CorrectSampledBytes", stats.sampled_bytes),
                        detail("Replica", team[index].id),
                        detail("ShardBegin", keys::printable(&range.begin)),
                        detail("ShardEnd", keys::printable(&range.end)),
                    ],
                );
                break;
            } else if *estimate < 0 {
                ctx.fail(
                    "Could not get storage metrics from server",
                    vec![detail("Replica", team[index].id)],
                );
                break;
            }
        }
    }

    let std_dev = stats.variance.sqrt();
    let estimate_error = (stats.shard_bytes - stats.sampled_bytes).abs();
    // Below ~30 samples the estimate does not resemble a normal distribution.
    if stats.sampled_keys > 30 && estimate_error as f64 > knobs::FAIL_ERROR_NUM_STD_DEV * std_dev {
        ctx.fail(
            "Shard size is more than 7 standard deviations from estimate",
            vec![
                detail("Min", bounds.min),
                detail("Max", bounds.max),
                detail("Estimate", stats.sampled_bytes),
                detail("Actual", stats.shard_bytes),
                detail("NumStdDev", estimate_error as f64 / std_dev),
                detail("Variance", stats.variance),
                detail("ShardBegin", keys::printable(&range.begin)),
                detail("ShardEnd", keys::printable(&range.end)),
                detail("NumKeys", stats.shard_keys),
                detail("NumSampledKeys", stats.sampled_keys),
            ],
        );
    }

    // Size bounds get a 3x permitted-error cushion because shard sizes are
    // not precise, and splits ignore a shard's first key, so it is excluded
    // from the upper bound. Shard-map shards are exempt.
    if stats.can_split
        && stats.sampled_keys > 5
        && ctx.quiescent
        && !range.begin.starts_with(KEY_SERVERS_PREFIX)
        && (stats.sampled_bytes < bounds.min - 3 * bounds.permitted_error
            || stats.sampled_bytes - stats.first_key_sampled_bytes
                > bounds.max + 3 * bounds.permitted_error)
    {
        let reason = if stats.sampled_bytes < bounds.min {
            "Shard size in quiescent database is too small"
        } else {
            "Shard size in quiescent database is too large"
        };
        ctx.fail(
            reason,
            vec![
                detail("Min", bounds.min),
                detail("Max", bounds.max),
                detail("Size", stats.shard_bytes),
                detail("EstimatedSize", stats.sampled_bytes),
                detail("ShardBegin", keys::printable(&range.begin)),
                detail("ShardEnd", keys::printable(&range.end)),
                detail("SampledKeys", stats.sampled_keys),
            ],
        );
        return Ok(false);
    }

    if stats.bytes_read > 0 {
        tracing::info!(range = %range, bytes_read = stats.bytes_read, "read range");
    }
    Ok(true)
}

/// Stream the shard from every replica in lockstep and compare. Returns
/// `None` when a violation aborted the round.
async fn stream_and_compare(
    ctx: &mut CheckContext<'_>,
    rate_gate: &mut RateGate,
    range: &KeyRange,
    team: &[ReplicaEndpoint],
    is_relocating: bool,
    bounds: &ShardSizeBounds,
) -> anyhow::Result<Option<ShardStats>> {
    let mut stats = ShardStats::default();
    let mut begin = range.begin.clone();
    let mut first_batch = true;

    loop {
        let version = oracle::current_version(ctx.db).await?;
        let req = GetKeyValuesRequest {
            range: KeyRange::new(begin.clone(), range.end.clone()),
            limit: knobs::COMPARISON_ROW_LIMIT,
            limit_bytes: knobs::REPLY_BYTE_LIMIT,
            version,
        };
        let replies = join_all(team.iter().map(|replica| {
            let req = req.clone();
            async move { reply_within(replica.rpc.get_key_values(req)).await }
        }))
        .await;

        // A stale or premature version restarts the current batch.
        if let Some(fault) = transaction_fault(&replies) {
            if matches!(
                fault,
                TransactionError::TransactionTooOld | TransactionError::FutureVersion
            ) {
                tracing::info!(error = %fault, "retrying comparison batch after version fault");
                continue;
            }
            return Err(fault.into());
        }

        let mut first_valid: Option<usize> = None;
        let mut total_read: i64 = 0;
        for (index, reply) in replies.iter().enumerate() {
            match reply {
                Ok(current) => {
                    total_read += current
                        .data
                        .iter()
                        .map(|kv| kv.expected_size() as i64)
                        .sum::<i64>();
                    match first_valid {
                        None => first_valid = Some(index),
                        Some(reference_index) => {
                            let reference = replies[reference_index]
                                .as_ref()
                                .expect("reference reply present");
                            if current.data != reference.data || current.more != reference.more {
                                let summary =
                                    classify_divergence(&current.data, &reference.data);
                                ctx.fail(
                                    "Data inconsistent",
                                    vec![
                                        detail("CurrentReplica", team[index].id),
                                        detail("ReferenceReplica", team[reference_index].id),
                                        detail("ShardBegin", keys::printable(&req.range.begin)),
                                        detail("ShardEnd", keys::printable(&req.range.end)),
                                        detail("Version", version),
                                        detail("CurrentUniques", summary.current_uniques),
                                        detail(
                                            "CurrentUniqueKey",
                                            keys::printable(&summary.current_unique_key),
                                        ),
                                        detail("ReferenceUniques", summary.reference_uniques),
                                        detail(
                                            "ReferenceUniqueKey",
                                            keys::printable(&summary.reference_unique_key),
                                        ),
                                        detail("ValueMismatches", summary.value_mismatches),
                                        detail(
                                            "ValueMismatchKey",
                                            keys::printable(&summary.value_mismatch_key),
                                        ),
                                        detail("MatchingKVPairs", summary.matching_pairs),
                                    ],
                                );
                                return Ok(None);
                            }
                        }
                    }
                }
                Err(err) if !is_relocating => {
                    tracing::warn!(
                        replica = %team[index].id,
                        address = %team[index].address,
                        shard = %range,
                        error = %err,
                        "storage replica unavailable during comparison"
                    );
                    // Every shard must be fully available in quiescence.
                    if ctx.quiescent {
                        ctx.fail(
                            "Storage server unavailable",
                            vec![
                                detail("Replica", team[index].id),
                                detail("Address", team[index].address),
                                detail("ShardBegin", keys::printable(&range.begin)),
                                detail("ShardEnd", keys::printable(&range.end)),
                            ],
                        );
                        return Ok(None);
                    }
                }
                Err(_) => {
                    // A destination replica may not have the shard yet.
                }
            }
        }

        let Some(reference_index) = first_valid else {
            break;
        };
        let reference = replies[reference_index]
            .as_ref()
            .expect("reference reply present");

        for (index, pair) in reference.data.iter().enumerate() {
            let sample = metrics::byte_sample(&pair.key, &pair.value);
            stats.shard_bytes += sample.size;
            let probability = sample.size as f64 / sample.sampled_size as f64;
            if probability < 1.0 {
                stats.variance +=
                    probability * (1.0 - probability) * (sample.sampled_size as f64).powi(2);
            }
            if sample.in_sample {
                stats.sampled_bytes += sample.sampled_size;
                if !stats.can_split
                    && stats.sampled_bytes >= bounds.min
                    && pair.key.len() <= knobs::SPLIT_KEY_SIZE_LIMIT
                    && stats.sampled_bytes as f64
                        <= bounds.max as f64 * knobs::UNFAIR_SPLIT_LIMIT / 2.0
                {
                    stats.can_split = true;
                    stats.split_bytes = stats.sampled_bytes;
                }
                // Split planning never counts a shard's first key, so the
                // size-bound check must not either.
                if first_batch && index == 0 {
                    stats.first_key_sampled_bytes += sample.sampled_size;
                }
                stats.sampled_keys += 1;
            }
        }
        stats.shard_keys += reference.data.len();

        // Pay for what was just read before issuing the next request.
        rate_gate.acquire(total_read.max(0) as usize).await;
        stats.bytes_read += total_read;

        if reference.more {
            let last = reference
                .data
                .last()
                .ok_or_else(|| anyhow::anyhow!("truncated comparison batch with no data"))?;
            begin = keys::key_after(&last.key);
            first_batch = false;
        } else {
            break;
        }
    }

    stats.can_split = stats.can_split
        && stats.sampled_bytes - stats.split_bytes >= bounds.min
        && stats.sampled_bytes > stats.split_bytes;
    Ok(Some(stats))
}

/// Resolve replica ids to live endpoints through the replica directory,
/// inside one retry-looped transaction. Entries missing from the directory
/// are a violation in quiescence and are skipped otherwise.
async fn resolve_team(
    ctx: &mut CheckContext<'_>,
    replica_ids: &[ReplicaId],
) -> anyhow::Result<Vec<ReplicaEndpoint>> {
    let mut tr = ctx.db.transaction();
    tr.set_option(TransactionOption::LockAware);
    let values = loop {
        let mut values = Vec::with_capacity(replica_ids.len());
        let mut fault = None;
        for id in replica_ids {
            match tr.get(&keys::server_list_key(id.0)).await {
                Ok(value) => values.push(value),
                Err(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }
        match fault {
            Some(err) => tr.on_error(err).await?,
            None => break values,
        }
    };

    let mut team = Vec::with_capacity(replica_ids.len());
    let mut missing = Vec::new();
    for (id, value) in replica_ids.iter().zip(values) {
        match value {
            Some(bytes) => {
                let descriptor = decode_replica_descriptor(&bytes)?;
                team.push(ctx.feed.connect(&descriptor));
            }
            None => missing.push(*id),
        }
    }
    if !missing.is_empty() && ctx.quiescent {
        ctx.fail(
            "Replica directory changed in a quiescent database",
            vec![detail(
                "MissingReplicas",
                missing
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            )],
        );
    }
    Ok(team)
}

/// Each replica's own size estimate for the shard, `-1` where unreachable.
/// An unexpected transactional fault empties the result.
async fn storage_size_estimates(team: &[ReplicaEndpoint], range: &KeyRange) -> Vec<i64> {
    let req = WaitMetricsRequest {
        keys: range.clone(),
    };
    let replies = join_all(team.iter().map(|replica| {
        let req = req.clone();
        async move { reply_within(replica.rpc.wait_metrics(req)).await }
    }))
    .await;

    let mut estimates = Vec::with_capacity(replies.len());
    let mut first_valid: Option<usize> = None;
    for (index, reply) in replies.iter().enumerate() {
        match reply {
            Err(RpcError::Transaction(fault)) => {
                tracing::warn!(shard = %range, error = %fault, "error fetching storage metrics");
                return Vec::new();
            }
            Err(err) => {
                tracing::warn!(
                    replica = %team[index].id,
                    shard = %range,
                    error = %err,
                    "failed to fetch storage metrics"
                );
                estimates.push(-1);
            }
            Ok(reply) => {
                estimates.push(reply.bytes);
                match first_valid {
                    None => first_valid = Some(index),
                    Some(first) if estimates[first] != reply.bytes => {
                        tracing::warn!(
                            estimate1 = estimates[first],
                            estimate2 = reply.bytes,
                            replica1 = %team[first].id,
                            replica2 = %team[index].id,
                            shard = %range,
                            "replicas disagree on shard size estimate"
                        );
                    }
                    Some(_) => {}
                }
            }
        }
    }
    estimates
}

/// Total database size, measured over the user key space.
async fn database_size(db: &dyn Database) -> Result<i64, TransactionError> {
    let mut tr = db.transaction();
    tr.set_option(TransactionOption::LockAware);
    loop {
        match tr.get_storage_metrics(keys::user_keys()).await {
            Ok(reply) => return Ok(reply.bytes),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

/// How two sorted page contents differ.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DivergenceSummary {
    pub current_uniques: usize,
    pub reference_uniques: usize,
    pub value_mismatches: usize,
    pub matching_pairs: usize,
    pub current_unique_key: Vec<u8>,
    pub reference_unique_key: Vec<u8>,
    pub value_mismatch_key: Vec<u8>,
}

/// Walk two sorted key/value sequences and classify every divergence.
pub(crate) fn classify_divergence(
    current: &[KeyValue],
    reference: &[KeyValue],
) -> DivergenceSummary {
    let mut summary = DivergenceSummary::default();
    let mut c = 0;
    let mut r = 0;
    while c < current.len() || r < reference.len() {
        if c >= current.len() {
            summary.reference_unique_key = reference[r].key.clone();
            summary.reference_uniques += 1;
            r += 1;
        } else if r >= reference.len() {
            summary.current_unique_key = current[c].key.clone();
            summary.current_uniques += 1;
            c += 1;
        } else if current[c].key == reference[r].key {
            if current[c].value == reference[r].value {
                summary.matching_pairs += 1;
            } else {
                summary.value_mismatch_key = current[c].key.clone();
                summary.value_mismatches += 1;
            }
            c += 1;
            r += 1;
        } else if current[c].key < reference[r].key {
            summary.current_unique_key = current[c].key.clone();
            summary.current_uniques += 1;
            c += 1;
        } else {
            summary.reference_unique_key = reference[r].key.clone();
            summary.reference_uniques += 1;
            r += 1;
        }
    }
    summary
}
