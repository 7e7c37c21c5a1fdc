use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One entry of the cluster directory: where to reach a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerInfo {
    pub fn new(host: impl Into<String>, tcp_port: u16, udp_port: u16) -> Self {
        Self { host: host.into(), tcp_port, udp_port }
    }
}

/// Full configuration for one node, identical in shape across the cluster
/// except for `node_id`. Loaded by `wardnet-node` from a TOML file,
/// environment overrides and CLI flags; every field here has the default
/// from the reference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    /// The cluster directory, `node_id -> (host, tcp_port, udp_port)`.
    /// Does not include an entry for `node_id` itself.
    pub cluster_directory: HashMap<NodeId, PeerInfo>,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "defaults::election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "defaults::grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "defaults::tcp_send_timeout_ms")]
    pub tcp_send_timeout_ms: u64,
    #[serde(default = "defaults::coordinator_announce_timeout_ms")]
    pub coordinator_announce_timeout_ms: u64,
}

mod defaults {
    pub fn heartbeat_interval_ms() -> u64 {
        3000
    }
    pub fn election_timeout_ms() -> u64 {
        10_000
    }
    pub fn grace_period_ms() -> u64 {
        30_000
    }
    pub fn tcp_send_timeout_ms() -> u64 {
        5_000
    }
    pub fn coordinator_announce_timeout_ms() -> u64 {
        1_000
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn tcp_send_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_send_timeout_ms)
    }

    pub fn coordinator_announce_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_announce_timeout_ms)
    }

    /// Reference port assignment: TCP `5555 + (node_id - 1)`, UDP
    /// `6000 + (node_id - 1)`. Any consistent pair works; this is only the
    /// default used when building a directory from a bare list of ids.
    pub fn reference_ports(node_id: NodeId) -> (u16, u16) {
        let offset = node_id.saturating_sub(1) as u16;
        (5555 + offset, 6000 + offset)
    }

    /// Basic structural validation: `node_id` must not be its own peer. An
    /// empty directory is not rejected — a cluster of one is a legitimate
    /// deployment and elects itself leader immediately, with no peers to
    /// list.
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_directory.contains_key(&self.node_id) {
            return Err(format!(
                "cluster_directory must not contain an entry for this node's own id ({})",
                self.node_id
            ));
        }
        Ok(())
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_directory.keys().copied()
    }
}
