//! Configuration types for stratus-node.
//! Parsed from ~/.stratus/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use stratus_cluster::NodeDescriptor;
use stratus_protocol::CURRENT_PARAMS;
use stratus_transfer::Pacing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub transfer: TransferSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_unique_id")]
    pub unique_id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
}

/// Static cluster topology: every node of the cluster, this one included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default)]
    pub nodes: Vec<ClusterNodeEntry>,
    /// How often unconnected peers are dialed again.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeEntry {
    pub unique_id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_pacing_every")]
    pub pacing_every: u32,
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub channel_queue_depth: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            pacing_every: default_pacing_every(),
            pacing_delay_ms: default_pacing_delay_ms(),
            channel_queue_depth: default_queue_depth(),
        }
    }
}

// Default value functions
fn default_unique_id() -> String {
    "Node-1".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:1410".into()
}
fn default_template_dir() -> String {
    "~/.stratus/templates".into()
}
fn default_reconnect_interval_ms() -> u64 {
    2000
}
fn default_call_timeout_ms() -> u64 {
    CURRENT_PARAMS.driver_call_timeout_ms
}
fn default_chunk_size() -> usize {
    CURRENT_PARAMS.chunk_size
}
fn default_pacing_every() -> u32 {
    CURRENT_PARAMS.pacing_every
}
fn default_pacing_delay_ms() -> u64 {
    CURRENT_PARAMS.pacing_delay_ms
}
fn default_queue_depth() -> usize {
    CURRENT_PARAMS.channel_queue_depth
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Topology snapshot for the registry, without this node.
    pub fn topology(&self) -> Vec<NodeDescriptor> {
        let own = stratus_cluster::normalize_id(&self.node.unique_id);
        self.cluster
            .nodes
            .iter()
            .filter(|entry| stratus_cluster::normalize_id(&entry.unique_id) != own)
            .map(|entry| NodeDescriptor {
                unique_id: entry.unique_id.clone(),
                addresses: entry.addresses.clone(),
                properties: Default::default(),
            })
            .collect()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.call_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.reconnect_interval_ms.max(1))
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            every: self.transfer.pacing_every,
            delay: Duration::from_millis(self.transfer.pacing_delay_ms),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                unique_id: default_unique_id(),
                listen_addr: default_listen_addr(),
                template_dir: default_template_dir(),
            },
            cluster: ClusterSection::default(),
            driver: DriverSection::default(),
            transfer: TransferSection::default(),
        }
    }
}
