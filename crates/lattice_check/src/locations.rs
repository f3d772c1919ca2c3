//! Location verifier: the replicas' own view of the shard map.
//!
//! Re-reads the shard-map table directly from the replicas the reconciler
//! named, page by page at a common snapshot version, and checks that every
//! replica of each map range returns identical pages. The merged result is
//! the contiguous boundary sequence the comparator walks: it tiles the full
//! key space with no gap or overlap, ending in a sentinel boundary.

use anyhow::Context;
use futures_util::future::join_all;
use lattice_cluster::keys::{self, KEY_SERVERS_PREFIX};
use lattice_cluster::rpc::{reply_within, GetKeyValuesReply, GetKeyValuesRequest, ShardAssignment};
use lattice_cluster::{KeyRange, KeyValue, RpcError, TransactionError};

use crate::knobs;
use crate::oracle;
use crate::round::{detail, CheckContext};

/// Merge the shard map as stored on the replicas themselves. Returns `None`
/// after recording a violation.
pub(crate) async fn key_locations(
    ctx: &mut CheckContext<'_>,
    assignments: &[ShardAssignment],
) -> anyhow::Result<Option<Vec<KeyValue>>> {
    let map_range = keys::key_servers_range();
    let mut begin = map_range.begin.clone();
    let end = map_range.end;
    let mut merged: Vec<KeyValue> = Vec::new();

    for assignment in assignments {
        anyhow::ensure!(
            !assignment.replicas.is_empty(),
            "shard-map assignment without replicas"
        );
        let clip_end = assignment.range.end.clone().min(end.clone());

        // Large ranges take several pages; each starts where the last ended.
        while begin < clip_end {
            let version = oracle::current_version(ctx.db).await?;
            let req = GetKeyValuesRequest {
                range: KeyRange::new(begin.clone(), clip_end.clone()),
                limit: knobs::SHARD_MAP_ROW_LIMIT,
                limit_bytes: knobs::SHARD_MAP_BYTE_LIMIT,
                version,
            };
            let replies = join_all(assignment.replicas.iter().map(|replica| {
                let req = req.clone();
                async move { reply_within(replica.rpc.get_key_values(req)).await }
            }))
            .await;

            if let Some(fault) = transaction_fault(&replies) {
                if matches!(
                    fault,
                    TransactionError::TransactionTooOld | TransactionError::FutureVersion
                ) {
                    tracing::info!(error = %fault, "retrying shard-map page after version fault");
                    continue;
                }
                return Err(fault.into());
            }

            let mut first_valid: Option<usize> = None;
            for (index, reply) in replies.iter().enumerate() {
                match reply {
                    Err(err) => {
                        // In a quiescent database every replica must answer.
                        if ctx.quiescent {
                            ctx.fail(
                                "Key server unavailable",
                                vec![
                                    detail("Replica", assignment.replicas[index].id),
                                    detail("Address", assignment.replicas[index].address),
                                    detail("Error", err),
                                ],
                            );
                            return Ok(None);
                        }
                        if first_valid.is_none() && index == replies.len() - 1 {
                            return Err(TransactionError::AllAlternativesFailed.into());
                        }
                    }
                    Ok(reply) => match first_valid {
                        None => first_valid = Some(index),
                        Some(reference_index) => {
                            let reference = replies[reference_index]
                                .as_ref()
                                .expect("reference reply present");
                            if reply.data != reference.data || reply.more != reference.more {
                                ctx.fail(
                                    "Key servers inconsistent",
                                    vec![
                                        detail(
                                            "Replica1",
                                            assignment.replicas[reference_index].id,
                                        ),
                                        detail("Replica2", assignment.replicas[index].id),
                                        detail("PageBegin", keys::printable(&begin)),
                                    ],
                                );
                                return Ok(None);
                            }
                        }
                    },
                }
            }

            let reference_index = first_valid.expect("at least one shard-map reply");
            let reference = replies[reference_index]
                .as_ref()
                .expect("reference reply present");
            begin = append_page(&mut merged, &begin, &clip_end, reference)?;
        }
    }

    // The sentinel closes the final shard.
    merged.push(KeyValue::new(keys::ALL_KEYS_END.to_vec(), Vec::new()));
    Ok(Some(merged))
}

/// Append one decoded shard-map page to `merged` and return the next page
/// start. Boundary keys at page seams are appended exactly once.
fn append_page(
    merged: &mut Vec<KeyValue>,
    begin: &[u8],
    clip_end: &[u8],
    reference: &GetKeyValuesReply,
) -> anyhow::Result<Vec<u8>> {
    let begin_boundary = keys::strip_prefix(begin, KEY_SERVERS_PREFIX)
        .context("shard-map page begin outside the table")?;
    let clip_boundary = keys::strip_prefix(clip_end, KEY_SERVERS_PREFIX)
        .context("shard-map page end outside the table")?;

    let mut boundaries = Vec::with_capacity(reference.data.len());
    for entry in &reference.data {
        let boundary = keys::strip_prefix(&entry.key, KEY_SERVERS_PREFIX)
            .context("shard-map entry outside the table")?;
        boundaries.push(KeyValue::new(boundary.to_vec(), entry.value.clone()));
    }
    anyhow::ensure!(!boundaries.is_empty(), "shard-map page returned no entries");

    // A truncated page only covers up to its last boundary; the next page
    // re-reads that boundary as its first key.
    let effective_end: &[u8] = if reference.more {
        &boundaries.last().expect("non-empty page").key
    } else {
        clip_boundary
    };

    if boundaries[0].key == begin_boundary {
        merged.push(boundaries[0].clone());
    }
    for entry in &boundaries {
        if entry.key.as_slice() > begin_boundary && entry.key.as_slice() < effective_end {
            merged.push(entry.clone());
        }
    }

    let next_begin = keys::key_servers_key(effective_end);
    anyhow::ensure!(
        next_begin.as_slice() > begin,
        "shard-map pagination made no progress"
    );
    Ok(next_begin)
}

/// First transactional rejection among the replies, if any.
pub(crate) fn transaction_fault(
    replies: &[Result<GetKeyValuesReply, RpcError>],
) -> Option<TransactionError> {
    replies.iter().find_map(|reply| match reply {
        Err(RpcError::Transaction(fault)) => Some(fault.clone()),
        _ => None,
    })
}
