//! Byte-sampling contract and shard size bounds.
//!
//! Replicas estimate shard sizes by sampling keys instead of summing every
//! pair. The sampling decision is a pure function of the key bytes, so any
//! two parties walking the same data derive the same estimate. Data
//! distribution sizes shards against the bounds computed here; diagnostics
//! reuse both to validate replica-reported estimates.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::keys::{KeyRange, KEY_SERVERS_PREFIX};

/// Aggregate size metrics for a key range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub bytes: i64,
}

/// Sampling verdict for one key/value pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSample {
    /// Actual wire size of the pair.
    pub size: i64,
    /// Size scaled by the inverse sampling probability.
    pub sampled_size: i64,
    /// Whether the pair lands in the sample.
    pub in_sample: bool,
}

/// Divisor applied to the sampling probability; larger means fewer samples.
pub const BYTE_SAMPLING_FACTOR: f64 = 250.0;
/// Fixed per-key overhead charged when computing the sampling probability.
pub const BYTE_SAMPLING_OVERHEAD: f64 = 100.0;

/// Decide whether one pair is in the byte sample.
///
/// The probability is proportional to the pair's size, so large pairs are
/// (almost) always sampled and the scaled sizes of sampled pairs sum to an
/// unbiased estimate of the true total.
pub fn byte_sample(key: &[u8], value: &[u8]) -> ByteSample {
    let size = (key.len() + value.len()) as i64;
    let probability =
        size as f64 / ((key.len() as f64 + BYTE_SAMPLING_OVERHEAD) * BYTE_SAMPLING_FACTOR);
    let sampled_size = (size as f64 / probability.min(1.0)) as i64;
    ByteSample {
        size,
        sampled_size,
        in_sample: key_fraction(key) < probability,
    }
}

/// Sampled-size sum over a range of pairs; the estimate replicas report.
pub fn sampled_bytes<'a>(
    pairs: impl IntoIterator<Item = (&'a [u8], &'a [u8])>,
) -> i64 {
    pairs
        .into_iter()
        .map(|(key, value)| {
            let sample = byte_sample(key, value);
            if sample.in_sample {
                sample.sampled_size
            } else {
                0
            }
        })
        .sum()
}

/// Deterministic hash of the key mapped onto `[0, 1)`.
fn key_fraction(key: &[u8]) -> f64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// Permitted size envelope for one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardSizeBounds {
    pub min: i64,
    pub max: i64,
    pub permitted_error: i64,
}

/// Floor of the per-shard size target.
pub const MIN_SHARD_BYTES: i64 = 200_000;
/// Ceiling of the per-shard size target.
pub const MAX_SHARD_BYTES: i64 = 500_000_000;
/// Growth of the size target with the square root of the database size.
pub const SHARD_BYTES_PER_SQRT_BYTES: i64 = 45;
/// Ratio between a shard's maximum size and its merge threshold.
pub const SHARD_BYTES_RATIO: i64 = 4;
/// Fixed bound applied to shards of the shard-map region itself.
pub const SYSTEM_SHARD_BYTES: i64 = 500_000_000;

/// Target maximum shard size for a database of the given total size.
pub fn max_shard_size(db_size_estimate: f64) -> i64 {
    (MIN_SHARD_BYTES + db_size_estimate.sqrt() as i64 * SHARD_BYTES_PER_SQRT_BYTES)
        .min(MAX_SHARD_BYTES)
}

/// Permitted size bounds for one shard, given the database-wide target.
///
/// Shard-map shards are exempt from the normal envelope; they are split on
/// boundary count, not bytes.
pub fn shard_size_bounds(range: &KeyRange, max_shard_size: i64) -> ShardSizeBounds {
    if range.begin.as_slice() >= KEY_SERVERS_PREFIX {
        ShardSizeBounds {
            min: 0,
            max: SYSTEM_SHARD_BYTES,
            permitted_error: SYSTEM_SHARD_BYTES,
        }
    } else {
        ShardSizeBounds {
            min: max_shard_size / SHARD_BYTES_RATIO,
            max: max_shard_size,
            permitted_error: max_shard_size / 10,
        }
    }
}
