//! Cluster configuration as read from the configuration table.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

use anyhow::Context;

use crate::keys::{strip_prefix, CONFIG_PREFIX};
use crate::rpc::{KeyValue, StoreType};

/// Parsed cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Desired number of source replicas per shard.
    pub storage_team_size: usize,
    /// Storage engine every replica should be running.
    pub desired_store_type: StoreType,
    /// Addresses excluded from recruitment.
    pub excluded: BTreeSet<SocketAddr>,
    /// Desired number of transaction logs.
    pub desired_logs: usize,
    /// Desired number of routing nodes.
    pub desired_proxies: usize,
    /// Desired number of resolvers.
    pub desired_resolvers: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            storage_team_size: 1,
            desired_store_type: StoreType::Memory,
            excluded: BTreeSet::new(),
            desired_logs: 1,
            desired_proxies: 1,
            desired_resolvers: 1,
        }
    }
}

impl ClusterConfig {
    /// Parse configuration entries read from the configuration table.
    ///
    /// Unknown names are ignored so newer clusters stay readable by older
    /// diagnostic clients.
    pub fn from_entries(entries: &[KeyValue]) -> anyhow::Result<Self> {
        let mut config = ClusterConfig::default();
        for entry in entries {
            let Some(raw_name) = strip_prefix(&entry.key, CONFIG_PREFIX) else {
                anyhow::bail!(
                    "configuration key outside the configuration table: {}",
                    crate::keys::printable(&entry.key)
                );
            };
            let name = std::str::from_utf8(raw_name).context("configuration name")?;
            let value = std::str::from_utf8(&entry.value)
                .with_context(|| format!("configuration value for {name}"))?;
            match name {
                "storage_team_size" => {
                    config.storage_team_size =
                        value.parse().context("parse storage_team_size")?;
                }
                "storage_engine" => {
                    config.desired_store_type = match value {
                        "memory" => StoreType::Memory,
                        "ssd" => StoreType::Ssd,
                        other => anyhow::bail!("unknown storage engine {other:?}"),
                    };
                }
                "logs" => config.desired_logs = value.parse().context("parse logs")?,
                "proxies" => config.desired_proxies = value.parse().context("parse proxies")?,
                "resolvers" => {
                    config.desired_resolvers = value.parse().context("parse resolvers")?;
                }
                name if name.starts_with("excluded/") => {
                    let addr = name["excluded/".len()..]
                        .parse::<SocketAddr>()
                        .with_context(|| format!("parse excluded address in {name}"))?;
                    config.excluded.insert(addr);
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Whether an address is excluded, either exactly or by IP.
    pub fn is_excluded(&self, address: SocketAddr) -> bool {
        self.excluded.contains(&address) || self.excluded_ips().any(|ip| ip == address.ip())
    }

    fn excluded_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        // Port 0 entries exclude a whole machine.
        self.excluded
            .iter()
            .filter(|addr| addr.port() == 0)
            .map(|addr| addr.ip())
    }
}
