//! Node registry -- thread-safe map of cluster nodes and their channels.
//!
//! Maps normalized node id → ClusterNode. Connections are owned by the node
//! runtime; the registry only tracks which channel a node is bound to and
//! fans packets out over those channels.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use stratus_protocol::{ChannelError, ChannelId, Packet, PacketChannel, PacketHeader, TransferHeader};
use stratus_transfer::{ChunkSender, TransferError, TransferSummary};
use tokio::io::AsyncRead;
use tokio::sync::RwLock;

use crate::node::{normalize_id, ClusterNode, NodeDescriptor};
use crate::RegistryError;

/// What a `reconcile` call changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Nodes dropped from the registry. Their channels are still bound so
    /// the caller can close them.
    pub removed: Vec<Arc<ClusterNode>>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Per-node outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(String, ChannelError)>,
}

/// Thread-safe registry of cluster nodes.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<ClusterNode>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace membership with `topology`.
    ///
    /// Unseen ids are added, known ids get their descriptor refreshed with
    /// the binding left alone, ids missing from the snapshot are removed.
    pub async fn reconcile(&self, topology: &[NodeDescriptor]) -> ReconcileReport {
        let wanted: HashMap<String, &NodeDescriptor> = topology
            .iter()
            .map(|descriptor| (normalize_id(&descriptor.unique_id), descriptor))
            .collect();

        let mut report = ReconcileReport::default();
        let mut nodes = self.inner.write().await;

        nodes.retain(|key, node| {
            let keep = wanted.contains_key(key);
            if !keep {
                report.removed.push(node.clone());
            }
            keep
        });

        for (key, descriptor) in wanted {
            match nodes.get(&key) {
                Some(node) => {
                    if node.descriptor().as_ref() != descriptor {
                        node.set_descriptor(descriptor.clone());
                        report.updated.push(descriptor.unique_id.clone());
                    }
                }
                None => {
                    nodes.insert(key, Arc::new(ClusterNode::new(descriptor.clone())));
                    report.added.push(descriptor.unique_id.clone());
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                cluster_size = nodes.len(),
                "registry: topology reconciled"
            );
        }
        report
    }

    /// Look a node up by id, ignoring case.
    pub async fn get(&self, unique_id: &str) -> Option<Arc<ClusterNode>> {
        self.inner.read().await.get(&normalize_id(unique_id)).cloned()
    }

    /// Node currently bound to `channel_id`.
    pub async fn get_by_channel(&self, channel_id: ChannelId) -> Option<Arc<ClusterNode>> {
        self.inner
            .read()
            .await
            .values()
            .find(|node| node.is_bound_to(channel_id))
            .cloned()
    }

    /// Bind `channel` to a known node. Returns the channel it replaced.
    pub async fn bind(
        &self,
        unique_id: &str,
        channel: Arc<dyn PacketChannel>,
    ) -> Result<Option<Arc<dyn PacketChannel>>, RegistryError> {
        let node = self
            .get(unique_id)
            .await
            .ok_or_else(|| RegistryError::UnknownNode(unique_id.to_string()))?;
        let channel_id = channel.channel_id();
        let previous = node.set_channel(Some(channel));
        tracing::info!(node = %node.unique_id(), channel_id, "registry: node connected");
        Ok(previous)
    }

    /// Drop the binding of whichever node uses `channel_id`.
    pub async fn unbind_channel(&self, channel_id: ChannelId) -> Option<Arc<ClusterNode>> {
        let node = self.get_by_channel(channel_id).await?;
        node.set_channel(None);
        tracing::info!(node = %node.unique_id(), channel_id, "registry: node disconnected");
        Some(node)
    }

    pub async fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn connected_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|node| node.is_connected())
            .count()
    }

    pub async fn has_connected(&self) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|node| node.is_connected())
    }

    /// Snapshot of bound channels; the map lock is released before any send.
    async fn bound_channels(&self) -> Vec<(String, Arc<dyn PacketChannel>)> {
        self.inner
            .read()
            .await
            .values()
            .filter_map(|node| node.channel().map(|channel| (node.unique_id(), channel)))
            .collect()
    }

    /// Queue `packet` on every bound channel. Failures are per node.
    pub async fn broadcast(&self, packet: &Packet) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (node, channel) in self.bound_channels().await {
            match channel.send(packet.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(%node, channel = packet.channel(), "registry: send failed: {e}");
                    report.failed.push((node, e));
                }
            }
        }
        report
    }

    /// Broadcast each packet in order.
    pub async fn broadcast_all(&self, packets: &[Packet]) -> Vec<BroadcastReport> {
        let mut reports = Vec::with_capacity(packets.len());
        for packet in packets {
            reports.push(self.broadcast(packet).await);
        }
        reports
    }

    /// Write `packet` to every bound channel, waiting for each write in turn.
    pub async fn broadcast_sync(&self, packet: &Packet) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (node, channel) in self.bound_channels().await {
            match channel.send_sync(packet.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(%node, channel = packet.channel(), "registry: sync send failed: {e}");
                    report.failed.push((node, e));
                }
            }
        }
        report
    }

    /// Stream a template to every connected node.
    ///
    /// Returns `Ok(None)` without emitting anything when no node is
    /// connected. A node failing mid-transfer does not stop the others.
    pub async fn deploy_resource_across_cluster<R>(
        &self,
        transfer: TransferHeader,
        source: R,
        sender: &ChunkSender,
    ) -> Result<Option<TransferSummary>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        if !self.has_connected().await {
            tracing::debug!(resource = %transfer.template, "registry: no node connected, deploy skipped");
            return Ok(None);
        }

        let resource = transfer.template.to_string();
        let summary = sender
            .send(source, transfer, PacketHeader::TemplateDeploy, |packet| {
                let registry = self.clone();
                async move {
                    registry.broadcast_sync(&packet).await;
                    Ok(())
                }
            })
            .await?;

        tracing::info!(
            %resource,
            session_id = %summary.session_id,
            chunks = summary.chunks,
            bytes = summary.total_bytes,
            "registry: template deployed across cluster"
        );
        Ok(Some(summary))
    }

    /// Like `deploy_resource_across_cluster`, from an in-memory buffer.
    pub async fn deploy_bytes_across_cluster(
        &self,
        transfer: TransferHeader,
        bytes: Bytes,
        sender: &ChunkSender,
    ) -> Result<Option<TransferSummary>, TransferError> {
        self.deploy_resource_across_cluster(transfer, bytes.as_ref(), sender)
            .await
    }

    /// Close every bound channel and forget all nodes. Idempotent.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<ClusterNode>> = {
            let mut nodes = self.inner.write().await;
            nodes.drain().map(|(_, node)| node).collect()
        };
        if drained.is_empty() {
            return;
        }
        for node in &drained {
            node.close().await;
        }
        tracing::info!(nodes = drained.len(), "registry: shut down");
    }
}
