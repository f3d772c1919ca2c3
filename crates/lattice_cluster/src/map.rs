//! Value codecs for the shard-map and replica-directory tables.

use std::net::SocketAddr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::rpc::ReplicaId;

/// Replica teams recorded at one shard boundary.
///
/// `sources` serve the shard today; a non-empty `destinations` means the
/// shard is being relocated onto those replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTeams {
    #[serde(default)]
    pub sources: Vec<ReplicaId>,
    #[serde(default)]
    pub destinations: Vec<ReplicaId>,
}

/// Encode a shard-map boundary value.
pub fn encode_shard_teams(teams: &ShardTeams) -> Vec<u8> {
    serde_json::to_vec(teams).expect("shard teams serialize")
}

/// Decode a shard-map boundary value; an empty value is an empty team.
pub fn decode_shard_teams(value: &[u8]) -> anyhow::Result<ShardTeams> {
    if value.is_empty() {
        return Ok(ShardTeams::default());
    }
    serde_json::from_slice(value).context("decode shard teams")
}

/// Replica-directory entry: where a replica id can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub id: ReplicaId,
    pub address: SocketAddr,
}

/// Encode a replica-directory value.
pub fn encode_replica_descriptor(descriptor: &ReplicaDescriptor) -> Vec<u8> {
    serde_json::to_vec(descriptor).expect("replica descriptor serialize")
}

/// Decode a replica-directory value.
pub fn decode_replica_descriptor(value: &[u8]) -> anyhow::Result<ReplicaDescriptor> {
    serde_json::from_slice(value).context("decode replica descriptor")
}
