//! Cluster membership over real TCP connections.

use std::time::Duration;

use stratus_cluster::NodeDescriptor;

use crate::harness::{test_node_count, TestMesh, TestNodeBuilder};

/// Two nodes bind each other's channel.
#[tokio::test]
async fn test_two_node_mesh() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let a = &mesh.nodes[0];
    let b = &mesh.nodes[1];
    assert!(a.node.registry().get("NODE-1").await.unwrap().is_connected());
    assert!(b.node.registry().get("node-0").await.unwrap().is_connected());
    mesh.shutdown_all().await;
}

/// N nodes all connected to each other. Default 3, override with TEST_NODE_COUNT.
#[tokio::test]
async fn test_n_node_mesh() {
    let n = test_node_count(3);
    let mesh = TestMesh::new(n).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(15)).await.unwrap();

    // one channel per pair
    for node in &mesh.nodes {
        assert_eq!(node.node.registry().connected_count().await, n - 1);
    }
    mesh.shutdown_all().await;
}

/// A node that goes away is unbound on its peers.
#[tokio::test]
async fn test_shutdown_unbinds_on_peers() {
    let mut mesh = TestMesh::new(3).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let gone = mesh.nodes.remove(2);
    gone.shutdown().await;

    for node in &mesh.nodes {
        node.wait_connected_at_most(1, Duration::from_secs(10)).await.unwrap();
        assert!(!node.node.registry().get("node-2").await.unwrap().is_connected());
    }
    mesh.shutdown_all().await;
}

/// A hello from a node outside the topology is refused.
#[tokio::test]
async fn test_unknown_node_is_refused() {
    let a = TestNodeBuilder::new("node-b").build().await.unwrap();
    let intruder = TestNodeBuilder::new("node-a")
        .peer("node-b", Some(a.listen_addr()))
        .build()
        .await
        .unwrap();

    // node-b closes every channel the intruder opens
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.node.registry().connected_count().await, 0);
    assert!(a.node.registry().is_empty().await);
    intruder
        .wait_connected_at_most(0, Duration::from_secs(5))
        .await
        .unwrap();

    intruder.shutdown().await;
    a.shutdown().await;
}

/// Removing a node from the topology drops its channel; adding it back
/// lets the reconnect loop dial it again.
#[tokio::test]
async fn test_topology_change_reconnects() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();
    let a = &mesh.nodes[0];
    let b = &mesh.nodes[1];

    let report = a.node.apply_topology(&[]).await;
    assert_eq!(report.removed.len(), 1);
    b.wait_connected_at_most(0, Duration::from_secs(10)).await.unwrap();

    let report = a
        .node
        .apply_topology(&[NodeDescriptor::new("node-1").with_address(b.listen_addr())])
        .await;
    assert_eq!(report.added, vec!["node-1".to_string()]);
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    mesh.shutdown_all().await;
}
