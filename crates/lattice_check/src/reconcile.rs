//! Shard-map reconciler: the routing nodes' view of shard placement.
//!
//! Walks the shard-map range in chunks, asking every current routing node
//! for the same chunk and racing the fan-out against a routing-set change.
//! In quiescent mode every routing node must answer; an unreachable one is
//! recorded as a violation, but the walk still runs to completion so the
//! downstream checks can surface their own findings. Outside quiescence the
//! first present reply wins and the rest are dropped (cancelling them).

use std::collections::BTreeSet;

use futures_util::future::join_all;
use lattice_cluster::keys;
use lattice_cluster::rpc::{reply_within, GetKeyServerLocationsRequest, ShardAssignment};

use crate::knobs;
use crate::round::{detail, CheckContext};

/// Resolve the `(range -> replica set)` assignment covering the shard map.
pub(crate) async fn key_server_assignments(
    ctx: &mut CheckContext<'_>,
    chunk_limit: usize,
) -> anyhow::Result<Vec<ShardAssignment>> {
    let map_range = keys::key_servers_range();
    let mut begin = map_range.begin.clone();
    let end = map_range.end.clone();
    let mut assignments: Vec<ShardAssignment> = Vec::new();
    // Each dead routing node is reported once, not once per chunk.
    let mut reported: BTreeSet<u64> = BTreeSet::new();

    while begin < end {
        let feed = ctx.feed;
        let nodes = feed.routing_nodes().await;
        anyhow::ensure!(!nodes.is_empty(), "cluster reported no routing nodes");

        let req = GetKeyServerLocationsRequest {
            begin: begin.clone(),
            end: end.clone(),
            limit: chunk_limit,
        };
        let fan_out = join_all(nodes.iter().map(|node| {
            let req = req.clone();
            async move { reply_within(node.rpc.get_key_server_locations(req)).await }
        }));

        let mut inserted = false;
        tokio::select! {
            replies = fan_out => {
                for (node, reply) in nodes.iter().zip(replies) {
                    match reply {
                        Err(err) if ctx.quiescent => {
                            if reported.insert(node.id) {
                                ctx.fail(
                                    "Routing node unavailable",
                                    vec![
                                        detail("RoutingNode", node.id),
                                        detail("Address", node.address),
                                        detail("Error", err),
                                    ],
                                );
                            }
                        }
                        Err(err) => {
                            tracing::debug!(node = node.id, error = %err, "routing node did not answer");
                        }
                        Ok(reply) if !inserted && !reply.results.is_empty() => {
                            begin = reply
                                .results
                                .last()
                                .expect("non-empty routing reply")
                                .range
                                .end
                                .clone();
                            assignments.extend(reply.results);
                            inserted = true;
                            // One answer is enough unless we must prove every
                            // routing node is alive.
                            if !ctx.quiescent {
                                break;
                            }
                        }
                        Ok(_) => {}
                    }
                }
            }
            _ = feed.routing_changed() => {
                tracing::debug!("routing set changed; restarting shard-map chunk");
                continue;
            }
        }

        if !inserted {
            tokio::time::sleep(knobs::EMPTY_CHUNK_BACKOFF).await;
        }
    }

    Ok(assignments)
}
