//! Cluster node entries.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use stratus_protocol::{ChannelId, PacketChannel};

/// One element of a topology snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub unique_id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl NodeDescriptor {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            addresses: Vec::new(),
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }
}

/// Registry key for a node id.
pub fn normalize_id(unique_id: &str) -> String {
    unique_id.to_lowercase()
}

/// A known node: its latest descriptor and, while connected, its channel.
///
/// Descriptor and binding are swapped whole, so a reader never observes a
/// half-updated entry.
pub struct ClusterNode {
    key: String,
    descriptor: RwLock<Arc<NodeDescriptor>>,
    channel: RwLock<Option<Arc<dyn PacketChannel>>>,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("unique_id", &self.descriptor().unique_id)
            .field("channel", &self.channel().map(|c| c.channel_id()))
            .finish()
    }
}

impl ClusterNode {
    pub(crate) fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            key: normalize_id(&descriptor.unique_id),
            descriptor: RwLock::new(Arc::new(descriptor)),
            channel: RwLock::new(None),
        }
    }

    /// Normalized id this node is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Id as last announced by the topology.
    pub fn unique_id(&self) -> String {
        self.descriptor().unique_id.clone()
    }

    pub fn descriptor(&self) -> Arc<NodeDescriptor> {
        self.descriptor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_descriptor(&self, descriptor: NodeDescriptor) {
        *self
            .descriptor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(descriptor);
    }

    pub fn channel(&self) -> Option<Arc<dyn PacketChannel>> {
        self.channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the binding, returning the previous channel.
    pub(crate) fn set_channel(
        &self,
        channel: Option<Arc<dyn PacketChannel>>,
    ) -> Option<Arc<dyn PacketChannel>> {
        let mut slot = self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, channel)
    }

    /// Whether the node is bound to `channel_id`.
    pub fn is_bound_to(&self, channel_id: ChannelId) -> bool {
        self.channel()
            .is_some_and(|channel| channel.channel_id() == channel_id)
    }

    /// Bound to an open channel.
    pub fn is_connected(&self) -> bool {
        self.channel().is_some_and(|channel| channel.is_open())
    }

    /// Close and drop the bound channel, if any.
    pub async fn close(&self) {
        if let Some(channel) = self.set_channel(None) {
            channel.close().await;
        }
    }
}
