//! Error types surfaced by the cluster seams.
//!
//! The transactional runtime reports faults by code so callers can decide
//! what to retry; transport errors carry whether the peer replied at all.

/// Faults reported by the transactional runtime.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The read version is older than the oldest retained version.
    #[error("transaction too old")]
    TransactionTooOld,
    /// The read version is ahead of the replica's committed version.
    #[error("future version")]
    FutureVersion,
    /// The request reached a replica that no longer owns the shard.
    #[error("wrong shard server")]
    WrongShardServer,
    /// Every candidate endpoint for a request failed.
    #[error("all alternatives failed")]
    AllAlternativesFailed,
    /// The target replica's request queue is full.
    #[error("server request queue full")]
    ServerRequestQueueFull,
    /// A requested metrics attribute is not tracked by the peer.
    #[error("attribute not found")]
    AttributeNotFound,
    /// Any other fault; not retryable.
    #[error("{0}")]
    Other(String),
}

impl TransactionError {
    /// Whether the transactional runtime suggests retrying after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransactionError::TransactionTooOld
                | TransactionError::FutureVersion
                | TransactionError::WrongShardServer
                | TransactionError::AllAlternativesFailed
                | TransactionError::ServerRequestQueueFull
        )
    }
}

/// Faults from a single bounded-duration RPC.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The peer could not be reached or never replied.
    #[error("endpoint unavailable")]
    Unavailable,
    /// The bounded wait elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,
    /// The peer replied with a transactional fault.
    #[error(transparent)]
    Transaction(TransactionError),
}

impl RpcError {
    /// True when the peer never produced a reply (as opposed to rejecting one).
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, RpcError::Unavailable | RpcError::Timeout)
    }
}
