//! Tuning constants for the check engine.

use std::time::Duration;

/// Upper bound on configuration entries read in one request; reading this
/// many back means the table overflowed the request.
pub const CONFIG_ROW_LIMIT: usize = 1_000;

/// Shard assignments requested from routing nodes per chunk. Small values
/// exercise chunked pagination.
pub const KEY_SERVER_LOCATION_LIMIT: usize = 100;

/// Row limit for one shard-map page read.
pub const SHARD_MAP_ROW_LIMIT: usize = 2_000;
/// Byte limit for one shard-map page read.
pub const SHARD_MAP_BYTE_LIMIT: usize = 100_000;

/// Row limit for one streaming comparison batch.
pub const COMPARISON_ROW_LIMIT: usize = 10_000;
/// Byte limit for one streaming comparison batch.
pub const REPLY_BYTE_LIMIT: usize = 80_000;

/// Keys longer than this are never chosen as shard split points.
pub const SPLIT_KEY_SIZE_LIMIT: usize = 5_000;
/// Tolerated imbalance between the two halves of a shard split.
pub const UNFAIR_SPLIT_LIMIT: f64 = 2.0 / 3.0;

/// Burst window of the per-replica read throttle, in seconds.
pub const RATE_WINDOW_SECONDS: f64 = 1.0;

/// Sampled size estimates further than this many standard deviations from
/// the measured size fail the round.
pub const FAIL_ERROR_NUM_STD_DEV: f64 = 7.0;

/// Largest tolerated transaction-log queue in a quiet database.
/// FIXME: should be zero?
pub const MAX_LOG_QUEUE_BYTES: i64 = 100_000;

/// Database size assumed outside simulation, where measuring it would read
/// every shard boundary.
pub const UNSIMULATED_DB_SIZE: f64 = 100e12;

/// Pause between rounds when running indefinitely.
pub const ROUND_PAUSE: Duration = Duration::from_secs(5);

/// Backoff when a routing chunk yields no shards.
pub const EMPTY_CHUNK_BACKOFF: Duration = Duration::from_secs(1);

/// Row limit when scanning the full replica directory.
pub const SERVER_LIST_ROW_LIMIT: usize = 10_000;
