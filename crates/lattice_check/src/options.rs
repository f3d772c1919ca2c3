//! Options accepted by the consistency check workload.

use std::time::Duration;

use anyhow::Context;

/// Parsed workload options. All fields have defaults; the harness supplies
/// overrides as string pairs which are parsed once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckOptions {
    /// Run the checks that only hold on a quiescent database.
    pub perform_quiescent_checks: bool,
    /// How long to wait for the database to go quiet before giving up.
    pub quiescent_wait_timeout: Duration,
    /// Partition the expensive per-shard checks across clients.
    pub distributed: bool,
    /// Fully check one out of every this many shards.
    pub shard_sample_factor: usize,
    /// Log violations at error severity instead of warn.
    pub failure_is_error: bool,
    /// Bytes per second to read from each replica; zero is unlimited.
    pub rate_limit: usize,
    /// Visit shards in a deterministic pseudo-random order.
    pub shuffle_shards: bool,
    /// Repeat rounds forever with a short pause between them.
    pub indefinite: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            perform_quiescent_checks: false,
            quiescent_wait_timeout: Duration::from_secs(600),
            distributed: true,
            shard_sample_factor: 1,
            failure_is_error: false,
            rate_limit: 0,
            shuffle_shards: false,
            indefinite: false,
        }
    }
}

impl CheckOptions {
    /// Parse harness option pairs. Unknown names are rejected so typos fail
    /// the test file rather than silently running a different check.
    pub fn from_options<'a>(
        options: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        for (name, value) in options {
            let context = || format!("option {name}={value}");
            match name {
                "performQuiescentChecks" => {
                    parsed.perform_quiescent_checks = value.parse().with_context(context)?;
                }
                "quiescentWaitTimeout" => {
                    let seconds: f64 = value.parse().with_context(context)?;
                    parsed.quiescent_wait_timeout = Duration::from_secs_f64(seconds);
                }
                "distributed" => parsed.distributed = value.parse().with_context(context)?,
                "shardSampleFactor" => {
                    let factor: usize = value.parse().with_context(context)?;
                    parsed.shard_sample_factor = factor.max(1);
                }
                "failureIsError" => {
                    parsed.failure_is_error = value.parse().with_context(context)?;
                }
                "rateLimit" => parsed.rate_limit = value.parse().with_context(context)?,
                "shuffleShards" => {
                    parsed.shuffle_shards = value.parse().with_context(context)?;
                }
                "indefinite" => parsed.indefinite = value.parse().with_context(context)?,
                other => anyhow::bail!("unknown consistency check option {other:?}"),
            }
        }
        Ok(parsed)
    }
}
