//! Consistency check engine for the Lattice key-value store.
//!
//! A diagnostic workload that verifies a running cluster: every replica of
//! every shard holds byte-identical data, the routing layer and the storage
//! replicas agree on the shard map, per-shard size statistics are accurate,
//! and, when the database is asserted quiescent, cluster-wide invariants
//! hold (drained queues, proper process roles, correct replication factors,
//! no orphan on-disk stores).
//!
//! The engine only reads; it never repairs, rebalances, or mutates cluster
//! state beyond optionally pausing the time-keeper and requesting process
//! reboots in simulation. The cluster itself is reached exclusively through
//! the seams in `lattice_cluster`.

pub mod options;
pub mod rate_gate;
pub mod round;

mod audit;
mod compare;
mod knobs;
mod locations;
mod oracle;
mod reconcile;

pub use options::CheckOptions;
pub use round::{ConsistencyCheck, RoundStats, Violation};
