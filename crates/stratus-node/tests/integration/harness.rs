//! Test harness for in-process stratus-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config), and TestMesh
//! (N-node orchestrator) running real TCP listeners in one tokio runtime.

use std::path::PathBuf;
use std::time::Duration;

use stratus_node::config::{ClusterNodeEntry, NodeConfig};
use stratus_node::Node;
use stratus_protocol::ServiceTemplate;
use stratus_transfer::FileSinkFactory;

/// Read TEST_NODE_COUNT from environment, falling back to `default`.
pub fn test_node_count(default: usize) -> usize {
    std::env::var("TEST_NODE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// A running in-process node installing templates into its own tempdir.
pub struct TestNode {
    pub node: Node,
    pub template_root: PathBuf,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub fn unique_id(&self) -> &str {
        self.node.unique_id()
    }

    pub fn listen_addr(&self) -> String {
        self.node.local_addr().to_string()
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }

    /// Poll the registry until at least `n` nodes are connected, or timeout.
    pub async fn wait_connected(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let connected = self.node.registry().connected_count().await;
            if connected >= n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for {} connected nodes (have {})",
                    self.unique_id(),
                    n,
                    connected,
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll the registry until at most `n` nodes are connected, or timeout.
    pub async fn wait_connected_at_most(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let connected = self.node.registry().connected_count().await;
            if connected <= n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for at most {} connected nodes (have {})",
                    self.unique_id(),
                    n,
                    connected,
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Where an installed template's payload lives on this node.
    pub fn template_file(&self, template: &ServiceTemplate) -> PathBuf {
        self.template_root
            .join(&template.storage)
            .join(&template.prefix)
            .join(&template.name)
            .join(stratus_transfer::sink::TEMPLATE_FILE_NAME)
    }

    /// Poll until the template's payload is installed, or timeout.
    pub async fn wait_template(
        &self,
        template: &ServiceTemplate,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let path = self.template_file(template);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                return Ok(bytes);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for template {} at {}",
                    self.unique_id(),
                    template,
                    path.display(),
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub struct TestNodeBuilder {
    unique_id: String,
    peers: Vec<ClusterNodeEntry>,
    chunk_size: Option<usize>,
    call_timeout_ms: Option<u64>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(unique_id: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            peers: Vec::new(),
            chunk_size: None,
            call_timeout_ms: None,
        }
    }

    /// A cluster member this node knows. Without an address the node waits
    /// for the peer to dial in.
    pub fn peer(mut self, unique_id: &str, address: Option<String>) -> Self {
        self.peers.push(ClusterNodeEntry {
            unique_id: unique_id.to_string(),
            addresses: address.into_iter().collect(),
        });
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        let template_root = tempdir.path().join("templates");

        let mut cfg = NodeConfig::default();
        cfg.node.unique_id = self.unique_id;
        cfg.node.listen_addr = "127.0.0.1:0".into();
        cfg.node.template_dir = template_root.display().to_string();
        cfg.cluster.nodes = self.peers;
        cfg.cluster.reconnect_interval_ms = 200;
        if let Some(chunk_size) = self.chunk_size {
            cfg.transfer.chunk_size = chunk_size;
        }
        if let Some(ms) = self.call_timeout_ms {
            cfg.driver.call_timeout_ms = ms;
        }

        let sinks = std::sync::Arc::new(FileSinkFactory::new(&template_root));
        let node = Node::start_with_sinks(cfg, sinks).await?;
        Ok(TestNode {
            node,
            template_root,
            _tempdir: tempdir,
        })
    }
}

pub struct TestMesh {
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestMesh {
    /// Create N nodes named node-0 .. node-{n-1}, all knowing each other.
    ///
    /// Lower ids dial higher ones, so nodes start from the highest id down
    /// and each one learns the addresses of the nodes already running.
    pub async fn new(n: usize) -> anyhow::Result<Self> {
        let ids: Vec<String> = (0..n).map(|i| format!("node-{i}")).collect();
        let mut started: Vec<TestNode> = Vec::new();

        for i in (0..n).rev() {
            let mut builder = TestNodeBuilder::new(&ids[i]);
            for (j, id) in ids.iter().enumerate() {
                if j == i {
                    continue;
                }
                let address = started
                    .iter()
                    .find(|node| node.unique_id() == id)
                    .map(|node| node.listen_addr());
                builder = builder.peer(id, address);
            }
            started.push(builder.build().await?);
        }

        started.reverse();
        Ok(Self { nodes: started })
    }

    /// Wait until every node is connected to every other node.
    pub async fn wait_full_mesh(&self, timeout: Duration) -> anyhow::Result<()> {
        let expected = self.nodes.len().saturating_sub(1);
        for node in &self.nodes {
            node.wait_connected(expected, timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
