//! Transactional client seam.
//!
//! The engine never talks to the commit pipeline; it only needs snapshot
//! read versions, point and range reads, and the runtime's retry/backoff
//! hook. `on_error` absorbs retryable faults (after the runtime's suggested
//! backoff) and propagates everything else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransactionError;
use crate::keys::KeyRange;
use crate::metrics::StorageMetrics;
use crate::rpc::KeyValue;

/// A committed database version usable for snapshot reads.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub i64);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options a diagnostic transaction may set before its first read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOption {
    /// Read through cluster locks; diagnostics must work on a locked cluster.
    LockAware,
}

/// Result of a transactional range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub entries: Vec<KeyValue>,
    pub more: bool,
}

/// One transaction context from the transactional client.
#[async_trait]
pub trait Transaction: Send {
    fn set_option(&mut self, option: TransactionOption);

    async fn get_read_version(&mut self) -> Result<Version, TransactionError>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TransactionError>;

    async fn get_range(
        &mut self,
        range: KeyRange,
        limit: usize,
    ) -> Result<RangeResult, TransactionError>;

    /// Aggregate size metrics over a range (sums per-shard statistics).
    async fn get_storage_metrics(
        &mut self,
        range: KeyRange,
    ) -> Result<StorageMetrics, TransactionError>;

    /// Classify `error`, wait the runtime's suggested backoff if it is
    /// retryable, and reset this context for another attempt. Non-retryable
    /// faults are returned unchanged.
    async fn on_error(&mut self, error: TransactionError) -> Result<(), TransactionError>;
}

/// Handle to the cluster through the transactional client.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a fresh transaction context.
    fn transaction(&self) -> Box<dyn Transaction>;

    /// Resolve once the cluster reports no in-flight writes, data movement,
    /// or queued work. The caller bounds the wait.
    async fn wait_quiescent(&self) -> Result<(), TransactionError>;

    /// Pause or resume the cluster time-keeper (simulation only).
    async fn set_time_keeper(&self, enabled: bool) -> Result<(), TransactionError>;
}
