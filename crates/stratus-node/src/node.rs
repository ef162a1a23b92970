//! A running cluster node: listener, connections, registry, local services.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use stratus_cluster::{NodeDescriptor, NodeRegistry, ReconcileReport, RegistryError};
use stratus_driver::{ServiceSelector, SpecificServiceProvider};
use stratus_protocol::{MemoryChannel, PacketChannel, ServiceTemplate, TransferHeader};
use stratus_transfer::{ChunkSender, FileSinkFactory, SinkFactory, TransferError, TransferSummary};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::connection::{self, Connections};
use crate::dispatcher::Dispatcher;
use crate::expand_tilde;
use crate::services::ServiceDirectory;

pub struct Node {
    config: NodeConfig,
    local_addr: SocketAddr,
    registry: NodeRegistry,
    directory: Arc<ServiceDirectory>,
    connections: Arc<Connections>,
    sender: ChunkSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node installing received templates below the configured
    /// template directory.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let root = expand_tilde(&config.node.template_dir);
        Self::start_with_sinks(config, Arc::new(FileSinkFactory::new(root))).await
    }

    /// Start a node installing received templates through `sinks`.
    pub async fn start_with_sinks(
        config: NodeConfig,
        sinks: Arc<dyn SinkFactory>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.node.listen_addr.as_str())
            .await
            .with_context(|| format!("failed to bind {}", config.node.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let registry = NodeRegistry::new();
        let directory = Arc::new(ServiceDirectory::new(config.node.unique_id.as_str()));
        let dispatcher = Arc::new(Dispatcher::new(
            config.node.unique_id.as_str(),
            registry.clone(),
            sinks,
            directory.clone(),
            config.call_timeout(),
        ));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let connections = Arc::new(Connections::new(
            dispatcher,
            registry.clone(),
            config.transfer.channel_queue_depth,
            shutdown_tx,
        ));
        let sender = ChunkSender::new(config.transfer.chunk_size, config.pacing());

        tracing::info!(
            node = %config.node.unique_id,
            %local_addr,
            peers = config.topology().len(),
            version = env!("CARGO_PKG_VERSION"),
            "node: starting"
        );

        let node = Self {
            local_addr,
            registry,
            directory,
            connections,
            sender,
            tasks: Mutex::new(Vec::new()),
            config,
        };

        // Peers must be known before any hello can be accepted.
        let topology = node.config.topology();
        node.registry.reconcile(&topology).await;

        // Subscribe before spawning; a shutdown right after start must reach both loops.
        let accept = tokio::spawn(connection::run_accept_loop(
            node.connections.clone(),
            listener,
            node.connections.subscribe_shutdown(),
        ));
        let reconnect = tokio::spawn(connection::run_reconnect_loop(
            node.connections.clone(),
            node.config.reconnect_interval(),
            node.connections.subscribe_shutdown(),
        ));
        node.push_tasks([accept, reconnect]);
        node.connect_peers().await;

        Ok(node)
    }

    fn push_tasks(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.extend(handles);
    }

    pub fn unique_id(&self) -> &str {
        &self.config.node.unique_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Services owned by this node.
    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.connections.dispatcher
    }

    /// Replace the known topology. Nodes that left are disconnected, new
    /// ones are dialed when this side is the dialer.
    pub async fn apply_topology(&self, topology: &[NodeDescriptor]) -> ReconcileReport {
        let report = self.registry.reconcile(topology).await;
        for node in &report.removed {
            node.close().await;
        }
        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "node: topology applied"
            );
        }
        self.connect_peers().await;
        report
    }

    /// Dial unconnected peers now instead of waiting for the reconnect loop.
    pub async fn connect_peers(&self) -> usize {
        self.connections.dial_missing().await
    }

    /// Connect this node to `other` over an in-process channel pair.
    pub fn link_in_memory(&self, other: &Node) {
        let depth = self.connections.queue_depth();
        let ((ours, our_rx), (theirs, their_rx)) = MemoryChannel::pair(
            self.connections.allocate_channel_id(),
            other.connections.allocate_channel_id(),
            depth,
        );
        let ours: Arc<dyn PacketChannel> = Arc::new(ours);
        let theirs: Arc<dyn PacketChannel> = Arc::new(theirs);
        self.connections.spawn_memory(ours, our_rx);
        other.connections.spawn_memory(theirs, their_rx);
    }

    /// Stream a template to every connected node.
    pub async fn deploy_template<R>(
        &self,
        template: ServiceTemplate,
        pre_clear: bool,
        source: R,
    ) -> Result<Option<TransferSummary>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.registry
            .deploy_resource_across_cluster(TransferHeader::new(template, pre_clear), source, &self.sender)
            .await
    }

    /// Stream a template file to every connected node.
    pub async fn deploy_template_file(
        &self,
        template: ServiceTemplate,
        pre_clear: bool,
        path: &Path,
    ) -> Result<Option<TransferSummary>, TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(TransferError::Source)?;
        self.deploy_template(template, pre_clear, file).await
    }

    /// Provider for a service owned by the node `node_id`.
    pub async fn provider(
        &self,
        node_id: &str,
        selector: ServiceSelector,
    ) -> Result<SpecificServiceProvider, RegistryError> {
        let client = self.dispatcher().driver_client_for(node_id).await?;
        Ok(SpecificServiceProvider::new(client, selector))
    }

    /// Stop accepting, close every channel and wait for the background
    /// tasks. Idempotent.
    pub async fn shutdown(&self) {
        self.connections.signal_shutdown();
        self.registry.shutdown().await;
        self.dispatcher().abort_sessions().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.config.node.unique_id, "node: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterNodeEntry;
    use std::time::Duration;
    use stratus_transfer::MemorySinkFactory;

    fn config(id: &str, peers: &[&str]) -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.node.unique_id = id.into();
        cfg.node.listen_addr = "127.0.0.1:0".into();
        cfg.cluster.nodes = peers
            .iter()
            .map(|p| ClusterNodeEntry {
                unique_id: (*p).into(),
                addresses: Vec::new(),
            })
            .collect();
        cfg
    }

    async fn wait_connected(node: &Node, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while node.registry().connected_count().await < expected {
            assert!(tokio::time::Instant::now() < deadline, "nodes never connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let node = Node::start_with_sinks(config("Node-1", &["Node-2"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.registry().len().await, 1);
        node.shutdown().await;
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_right_after_start_returns() {
        let node = Node::start_with_sinks(config("Node-1", &["Node-2"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), node.shutdown())
            .await
            .expect("shutdown hung");
    }

    #[tokio::test]
    async fn test_memory_link_and_template_deploy() {
        let sinks = MemorySinkFactory::new();
        let a = Node::start_with_sinks(config("Node-1", &["Node-2"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        let b = Node::start_with_sinks(config("Node-2", &["Node-1"]), Arc::new(sinks.clone()))
            .await
            .unwrap();

        a.link_in_memory(&b);
        wait_connected(&a, 1).await;
        wait_connected(&b, 1).await;

        let mut installed = b.dispatcher().subscribe_installed();
        let template = ServiceTemplate::local("Lobby", "default");
        let summary = a
            .deploy_template(template.clone(), false, &b"lobby payload"[..])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_bytes, 13);

        let done = tokio::time::timeout(Duration::from_secs(5), installed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.transfer.template, template);
        assert_eq!(sinks.get(&template).unwrap().as_ref(), b"lobby payload");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_topology_disconnects_removed_node() {
        let a = Node::start_with_sinks(config("Node-1", &["Node-2"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        let b = Node::start_with_sinks(config("Node-2", &["Node-1"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        a.link_in_memory(&b);
        wait_connected(&b, 1).await;

        let report = a.apply_topology(&[]).await;
        assert_eq!(report.removed.len(), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.registry().connected_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "peer never noticed the close");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_provider_requires_connected_node() {
        let a = Node::start_with_sinks(config("Node-1", &["Node-2"]), Arc::new(MemorySinkFactory::new()))
            .await
            .unwrap();
        let err = a
            .provider("Node-2", ServiceSelector::ByName("Lobby-1".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::NotConnected(_)));
        a.shutdown().await;
    }
}
