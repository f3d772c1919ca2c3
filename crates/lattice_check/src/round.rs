//! Check round driver.
//!
//! A round reads the cluster configuration, runs the quiescent-only audits
//! on the first client, reconciles the shard map through the routing nodes,
//! verifies the map against the replicas' own view, and finally streams and
//! compares every (sampled) shard. The round owns all derived state; each
//! component gets a borrow of the shared [`CheckContext`] and records
//! violations into it.

use std::collections::BTreeMap;

use lattice_cluster::{
    keys, ClusterConfig, ClusterFeed, Database, ReplicaId, Simulator, TransactionError,
    TransactionOption,
};
use serde::Serialize;

use crate::{audit, compare, knobs, locations, options::CheckOptions, reconcile};

/// One recorded invariant violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub reason: String,
    pub details: BTreeMap<String, String>,
}

/// Outcome of one check round.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RoundStats {
    pub success: bool,
    pub violations: Vec<Violation>,
    /// Per-replica byte totals accumulated while walking shards.
    pub replica_bytes: BTreeMap<ReplicaId, i64>,
}

impl RoundStats {
    fn new() -> Self {
        Self {
            success: true,
            violations: Vec::new(),
            replica_bytes: BTreeMap::new(),
        }
    }
}

/// Round-scoped state shared by the check components.
pub(crate) struct CheckContext<'a> {
    pub db: &'a dyn Database,
    pub feed: &'a dyn ClusterFeed,
    pub sim: &'a dyn Simulator,
    pub options: CheckOptions,
    /// Quiescent-mode checks enabled for this round.
    pub quiescent: bool,
    pub client_id: usize,
    pub client_count: usize,
    /// Seed all distributed clients agree on for this repetition.
    pub shuffle_seed: u64,
    pub stats: RoundStats,
}

impl CheckContext<'_> {
    pub fn first_client(&self) -> bool {
        self.client_id == 0
    }

    /// Record a violation and log it at the configured severity.
    pub fn fail(&mut self, reason: &str, details: Vec<(String, String)>) {
        let details: BTreeMap<String, String> = details.into_iter().collect();
        let workload = if self.quiescent {
            "quiescent_check"
        } else {
            "consistency_check"
        };
        if self.options.failure_is_error {
            tracing::error!(workload, reason, ?details, "consistency check failure");
        } else {
            tracing::warn!(workload, reason, ?details, "consistency check failure");
        }
        self.stats.success = false;
        self.stats.violations.push(Violation {
            reason: reason.to_string(),
            details,
        });
    }
}

/// Violation detail entry.
pub(crate) fn detail(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// The consistency check workload: one client's share of the check, run as
/// one round or repeated indefinitely.
pub struct ConsistencyCheck {
    options: CheckOptions,
    client_id: usize,
    client_count: usize,
    /// Random value the harness hands to every client of one test.
    shared_random_number: u64,
    /// Rounds completed by this client so far.
    repetitions: u64,
    /// Downgraded when the database cannot be made quiet.
    quiescent: bool,
    success: bool,
}

impl ConsistencyCheck {
    pub fn new(
        options: CheckOptions,
        client_id: usize,
        client_count: usize,
        shared_random_number: u64,
    ) -> Self {
        let quiescent = options.perform_quiescent_checks;
        Self {
            options,
            client_id,
            client_count: client_count.max(1),
            shared_random_number,
            repetitions: 0,
            quiescent,
            success: true,
        }
    }

    fn first_client(&self) -> bool {
        self.client_id == 0
    }

    /// Whether every round so far has been violation-free.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Prepare for quiescent checks: pause the time-keeper (simulation only)
    /// and wait for the database to go quiet. Failing to get quiet records a
    /// failure and downgrades the round to non-quiescent mode.
    pub async fn setup(&mut self, db: &dyn Database, sim: &dyn Simulator) -> anyhow::Result<()> {
        if !(self.first_client() && self.options.perform_quiescent_checks) {
            return Ok(());
        }
        if sim.is_simulated() {
            db.set_time_keeper(false).await?;
        }
        let quiet = tokio::time::timeout(self.options.quiescent_wait_timeout, db.wait_quiescent());
        let failure = match quiet.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("quiescence wait timed out".to_string()),
        };
        if let Some(error) = failure {
            if self.options.failure_is_error {
                tracing::error!(error = %error, "unable to achieve a quiet database");
            } else {
                tracing::warn!(error = %error, "unable to achieve a quiet database");
            }
            self.success = false;
            self.quiescent = false;
        }
        Ok(())
    }

    /// Run rounds until done: once normally, forever when `indefinite` is
    /// set. Returns whether every round succeeded.
    pub async fn run(
        &mut self,
        db: &dyn Database,
        feed: &dyn ClusterFeed,
        sim: &dyn Simulator,
    ) -> anyhow::Result<bool> {
        loop {
            self.run_round(db, feed, sim).await?;
            if !self.options.indefinite {
                break;
            }
            self.repetitions += 1;
            tokio::time::sleep(knobs::ROUND_PAUSE).await;
        }
        Ok(self.success)
    }

    /// Run one check round and return its outcome.
    pub async fn run_round(
        &mut self,
        db: &dyn Database,
        feed: &dyn ClusterFeed,
        sim: &dyn Simulator,
    ) -> anyhow::Result<RoundStats> {
        let mut ctx = CheckContext {
            db,
            feed,
            sim,
            options: self.options.clone(),
            quiescent: self.quiescent,
            client_id: self.client_id,
            client_count: self.client_count,
            shuffle_seed: self.shared_random_number.wrapping_add(self.repetitions),
            stats: RoundStats::new(),
        };

        // In a non-distributed test only the first client does anything.
        if self.first_client() || self.options.distributed {
            if let Err(err) = check_once(&mut ctx).await {
                match err.downcast_ref::<TransactionError>() {
                    Some(fault) if fault.is_retryable() => {
                        // TODO: retry the round on these transient faults
                        // instead of deferring to the next repetition.
                        tracing::info!(error = %fault, "consistency check hit a transient fault");
                    }
                    _ => ctx.fail(&format!("Error: {err:#}"), Vec::new()),
                }
            }
        }

        tracing::debug!(
            repetitions = self.repetitions,
            success = ctx.stats.success,
            "finished consistency check round"
        );
        self.success &= ctx.stats.success;
        Ok(ctx.stats)
    }
}

/// One pass over the whole check: config, audits, shard map, data.
async fn check_once(ctx: &mut CheckContext<'_>) -> anyhow::Result<()> {
    let config = read_config(ctx).await?;

    if ctx.first_client() && ctx.quiescent {
        audit::run_quiescent_checks(ctx, &config).await?;
    }

    let assignments =
        reconcile::key_server_assignments(ctx, knobs::KEY_SERVER_LOCATION_LIMIT).await?;
    let Some(key_locations) = locations::key_locations(ctx, &assignments).await? else {
        return Ok(());
    };
    compare::check_data_consistency(ctx, &key_locations, &config).await?;
    Ok(())
}

/// Read and parse the cluster configuration table.
async fn read_config(ctx: &mut CheckContext<'_>) -> anyhow::Result<ClusterConfig> {
    let mut tr = ctx.db.transaction();
    tr.set_option(TransactionOption::LockAware);
    loop {
        match tr
            .get_range(keys::config_range(), knobs::CONFIG_ROW_LIMIT)
            .await
        {
            Ok(result) => {
                if result.entries.len() >= knobs::CONFIG_ROW_LIMIT {
                    ctx.fail("Read too many configuration options", Vec::new());
                }
                return Ok(ClusterConfig::from_entries(&result.entries)?);
            }
            Err(err) => tr.on_error(err).await?,
        }
    }
}
