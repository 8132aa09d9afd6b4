//! Partition configuration: parsed TOML describing server lists,
//! striping parameters, and session-mode switches.

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{XpnError, XpnResult};

/// Transport backend a partition's servers are reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Socket,
    Fabric,
    Local,
    Mpi,
}

impl TransportKind {
    /// `fabric`/`mpi` are recognized by the config parser (so a typo'd
    /// transport name is rejected, not silently ignored) but are not
    /// implemented by this crate's transport façade.
    pub fn is_implemented(self) -> bool {
        matches!(self, TransportKind::Socket | TransportKind::Local)
    }
}

/// Striping policy. Only `round-robin` (with master-first skew) is
/// currently recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    #[default]
    RoundRobin,
}

/// One server endpoint within a partition's ordered server list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEndpoint {
    pub transport: TransportKind,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServerEndpoint {
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// A named set of servers plus striping parameters that jointly present
/// one logical namespace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    pub servers: Vec<ServerEndpoint>,
    pub block_size: u64,
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub session_file: bool,
    #[serde(default)]
    pub session_dir: bool,
}

fn default_replica_count() -> u32 {
    1
}

impl PartitionConfig {
    /// Validates the invariants `spec.md` §3 requires of a partition:
    /// a positive power-of-two block size, at least one replica, and at
    /// least one server.
    pub fn validate(&self) -> XpnResult<()> {
        if self.servers.is_empty() {
            return Err(XpnError::InvalidArgument(format!("partition {} has no servers", self.name)));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(XpnError::InvalidArgument(format!(
                "partition {} block_size must be a positive power of two",
                self.name
            )));
        }
        if self.replica_count == 0 {
            return Err(XpnError::InvalidArgument(format!(
                "partition {} replica_count must be >= 1",
                self.name
            )));
        }
        if usize::try_from(self.replica_count).unwrap_or(usize::MAX) > self.servers.len() {
            return Err(XpnError::InvalidArgument(format!(
                "partition {} replica_count exceeds server_count",
                self.name
            )));
        }
        Ok(())
    }

    pub fn server_count(&self) -> u32 {
        self.servers.len() as u32
    }
}

/// Top-level configuration: every recognized partition plus the
/// membership controller's out-of-band channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XpnConfig {
    #[serde(default)]
    pub controller_url: Option<String>,
    #[serde(rename = "partition", default)]
    pub partitions: Vec<PartitionConfig>,
}

impl XpnConfig {
    pub fn parse(input: &str) -> XpnResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| XpnError::InvalidArgument(e.to_string()))?;
        for partition in &config.partitions {
            partition.validate()?;
        }
        Ok(config)
    }

    pub fn by_name(&self) -> HashMap<String, &PartitionConfig> {
        self.partitions.iter().map(|p| (p.name.clone(), p)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
        controller_url = "127.0.0.1:9000"

        [[partition]]
        name = "default"
        block_size = 524288
        replica_count = 2

        [[partition.servers]]
        transport = "socket"
        host = "node0"
        port = 3333

        [[partition.servers]]
        transport = "socket"
        host = "node1"
        port = 3333
    "#;

    #[test]
    fn parses_a_well_formed_partition() {
        let config = XpnConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.partitions.len(), 1);
        let partition = &config.partitions[0];
        assert_eq!(partition.server_count(), 2);
        assert_eq!(partition.policy, Policy::RoundRobin);
        assert_eq!(partition.replica_count, 2);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let bad = SAMPLE.replace("524288", "524289");
        let err = XpnConfig::parse(&bad).unwrap_err();
        assert!(matches!(err, XpnError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let bad = SAMPLE.replace("block_size", "blocksize_typo");
        assert!(XpnConfig::parse(&bad).is_err());
    }

    #[test]
    fn rejects_replica_count_above_server_count() {
        let bad = SAMPLE.replace("replica_count = 2", "replica_count = 5");
        let err = XpnConfig::parse(&bad).unwrap_err();
        assert!(matches!(err, XpnError::InvalidArgument(_)));
    }
}
