// src/core/cluster/config.rs

//! Defines the cluster-specific configuration options.

use serde::{Deserialize, Serialize};

/// Holds all configuration settings related to cluster mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// If `true`, the server will start in cluster mode.
    #[serde(default)]
    pub enabled: bool,
    /// The path to the cluster configuration file (e.g., `nodes.conf`).
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// The timeout in milliseconds after which a node is considered to be in a
    /// PFAIL (Possible Failure) state if no PONG is received.
    #[serde(default = "default_node_timeout")]
    pub node_timeout: u64,
    /// An optional IP address to announce to other nodes in the cluster.
    pub announce_ip: Option<String>,
    /// An optional port to announce for client connections.
    pub announce_port: Option<u16>,
    /// An optional port to announce for the cluster bus communication.
    pub announce_bus_port: Option<u16>,
    /// The port offset for the cluster bus.
    /// The final bus port will be client_port + bus_port_offset.
    #[serde(default = "default_bus_port_offset")]
    pub bus_port_offset: u16,
    /// The number of master nodes that must be reachable for a master to remain writable.
    /// This is the primary mechanism to prevent split-brain during partitions.
    /// It should be set to (total_masters / 2) + 1.
    #[serde(default = "default_failover_quorum")]
    pub failover_quorum: usize,
    /// Gossip scheduler tick period, target 10Hz.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How many ticks elapse between the "ping the staleset peer" sweep.
    #[serde(default = "default_ping_sweep_ticks")]
    pub ping_sweep_ticks: u32,
    /// Multiplier applied to `node_timeout` to expire a PFAIL report.
    #[serde(default = "default_pfail_validity_multiplier")]
    pub pfail_validity_multiplier: u32,
    /// Multiplier applied to `node_timeout` governing how long a stale FAIL
    /// verdict on a still-slot-owning primary resists reversal.
    #[serde(default = "default_fail_undo_multiplier")]
    pub fail_undo_multiplier: u32,
    /// Manual failover deadline, in milliseconds.
    #[serde(default = "default_mf_timeout_ms")]
    pub mf_timeout_ms: u64,
    /// Number of peers sampled per gossip message.
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_file: "nodes.conf".to_string(),
            node_timeout: 15000,
            announce_ip: None,
            announce_port: None,
            announce_bus_port: None,
            bus_port_offset: 10000,
            failover_quorum: 2, // A safe default for a minimal 3-master setup.
            tick_interval_ms: default_tick_interval_ms(),
            ping_sweep_ticks: default_ping_sweep_ticks(),
            pfail_validity_multiplier: default_pfail_validity_multiplier(),
            fail_undo_multiplier: default_fail_undo_multiplier(),
            mf_timeout_ms: default_mf_timeout_ms(),
            gossip_fanout: default_gossip_fanout(),
        }
    }
}

fn default_config_file() -> String {
    "nodes.conf".to_string()
}
fn default_node_timeout() -> u64 {
    15000
}
fn default_bus_port_offset() -> u16 {
    10000
}
fn default_failover_quorum() -> usize {
    2
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_ping_sweep_ticks() -> u32 {
    10
}
fn default_pfail_validity_multiplier() -> u32 {
    2
}
fn default_fail_undo_multiplier() -> u32 {
    2
}
fn default_mf_timeout_ms() -> u64 {
    10_000
}
fn default_gossip_fanout() -> usize {
    3
}

impl ClusterConfig {
    pub fn node_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.node_timeout)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    pub fn pfail_validity(&self) -> std::time::Duration {
        self.node_timeout() * self.pfail_validity_multiplier
    }

    pub fn fail_undo_validity(&self) -> std::time::Duration {
        self.node_timeout() * self.fail_undo_multiplier
    }

    pub fn mf_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.mf_timeout_ms)
    }

    pub fn auth_timeout(&self) -> std::time::Duration {
        std::cmp::max(self.node_timeout() * 2, std::time::Duration::from_secs(2))
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::cmp::max(self.node_timeout(), std::time::Duration::from_secs(1))
    }
}
