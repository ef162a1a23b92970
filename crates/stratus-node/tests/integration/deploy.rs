//! Template distribution across a live cluster.

use std::time::Duration;

use stratus_protocol::ServiceTemplate;

use crate::harness::{TestMesh, TestNodeBuilder};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A multi-chunk template reaches every other node intact.
#[tokio::test]
async fn test_template_reaches_every_node() {
    let mesh = TestMesh::new(3).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let template = ServiceTemplate::local("Lobby", "default");
    let data = payload(300 * 1024);
    let summary = mesh.nodes[0]
        .node
        .deploy_template(template.clone(), false, data.as_slice())
        .await
        .unwrap()
        .expect("nodes are connected");

    // 64 KiB chunks plus the terminal chunk
    assert_eq!(summary.chunks, 6);
    assert_eq!(summary.total_bytes, data.len() as u64);

    for node in &mesh.nodes[1..] {
        let installed = node
            .wait_template(&template, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(installed, data);
    }
    // the sender does not install its own template
    assert!(!mesh.nodes[0].template_file(&template).exists());

    mesh.shutdown_all().await;
}

/// Deploying with nobody connected sends nothing.
#[tokio::test]
async fn test_deploy_without_connected_nodes() {
    let lonely = TestNodeBuilder::new("node-0")
        .peer("node-1", None)
        .build()
        .await
        .unwrap();

    let summary = lonely
        .node
        .deploy_template(ServiceTemplate::local("Lobby", "default"), false, &b"data"[..])
        .await
        .unwrap();
    assert!(summary.is_none());

    lonely.shutdown().await;
}

/// An empty template installs as an empty file.
#[tokio::test]
async fn test_empty_template() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let template = ServiceTemplate::local("Proxy", "empty");
    let summary = mesh.nodes[0]
        .node
        .deploy_template(template.clone(), false, &b""[..])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.chunks, 1);

    let installed = mesh.nodes[1]
        .wait_template(&template, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(installed.is_empty());

    mesh.shutdown_all().await;
}

/// pre_clear wipes the template directory before installing.
#[tokio::test]
async fn test_pre_clear_replaces_directory() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();
    let receiver = &mesh.nodes[1];

    let template = ServiceTemplate::local("Lobby", "default");
    let dir = receiver.template_file(&template).parent().unwrap().to_path_buf();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("stale.txt"), b"old").unwrap();

    let mut installed = receiver.node.dispatcher().subscribe_installed();
    mesh.nodes[0]
        .node
        .deploy_template(template.clone(), true, &b"fresh"[..])
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), installed.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(std::fs::read(receiver.template_file(&template)).unwrap(), b"fresh");
    assert!(!dir.join("stale.txt").exists());

    mesh.shutdown_all().await;
}

/// Deploying from a file on disk.
#[tokio::test]
async fn test_deploy_template_file() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("lobby.bin");
    let data = payload(100 * 1024);
    std::fs::write(&source, &data).unwrap();

    let template = ServiceTemplate::local("Lobby", "file");
    mesh.nodes[0]
        .node
        .deploy_template_file(template.clone(), false, &source)
        .await
        .unwrap()
        .unwrap();

    let installed = mesh.nodes[1]
        .wait_template(&template, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(installed, data);

    mesh.shutdown_all().await;
}
