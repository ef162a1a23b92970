//! Remote service control through the driver API.

use std::time::Duration;

use stratus_driver::{DriverError, ServiceSelector};
use stratus_protocol::{HostAndPort, ServiceLifeCycle, ServiceTemplate};

use crate::harness::TestMesh;

fn address() -> HostAndPort {
    HostAndPort {
        host: "127.0.0.1".into(),
        port: 44955,
    }
}

/// Lifecycle changes issued by one node land on the owning node.
#[tokio::test]
async fn test_remote_lifecycle() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();
    let owner = &mesh.nodes[1];
    let service = owner.node.directory().create("Lobby", address()).await;

    let provider = mesh.nodes[0]
        .node
        .provider("node-1", ServiceSelector::ByName("Lobby-1".into()))
        .await
        .unwrap();

    provider.start().await.unwrap();
    let snapshot = provider.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.unique_id(), service.unique_id());
    assert_eq!(snapshot.life_cycle, ServiceLifeCycle::Running);

    provider.stop().await.unwrap();
    assert_eq!(
        owner.node.directory().get(service.unique_id()).await.unwrap().life_cycle,
        ServiceLifeCycle::Stopped
    );

    provider.delete().await.unwrap();
    assert_eq!(
        owner.node.directory().get(service.unique_id()).await.unwrap().life_cycle,
        ServiceLifeCycle::Deleted
    );
    // deleted services stay resolvable
    assert!(provider.is_valid().await.unwrap());

    mesh.shutdown_all().await;
}

/// Commands, templates and logs round-trip by unique id.
#[tokio::test]
async fn test_remote_commands_and_logs() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();
    let owner = &mesh.nodes[1];
    let service = owner.node.directory().create("Lobby", address()).await;
    let id = service.unique_id();

    let provider = mesh.nodes[0]
        .node
        .provider("node-1", ServiceSelector::ById(id))
        .await
        .unwrap();

    provider.run_command("say hello").await.unwrap();
    let template = ServiceTemplate::local("Lobby", "plugins");
    provider.add_service_template(&template).await.unwrap();
    provider.include_waiting_templates().await.unwrap();

    let directory = owner.node.directory();
    assert_eq!(directory.commands(id).await.unwrap(), vec!["say hello"]);
    assert_eq!(directory.installed_templates(id).await.unwrap(), vec![template]);

    let log = provider.cached_log_messages().await.unwrap().unwrap();
    assert!(log.iter().any(|line| line == "> say hello"));

    mesh.shutdown_all().await;
}

/// Reads of a missing service answer None; mutations fail with TargetNotFound.
#[tokio::test]
async fn test_missing_service() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let provider = mesh.nodes[0]
        .node
        .provider("node-1", ServiceSelector::ByName("Ghost-1".into()))
        .await
        .unwrap();

    assert!(provider.snapshot().await.unwrap().is_none());
    assert!(!provider.is_valid().await.unwrap());
    assert!(matches!(provider.start().await, Err(DriverError::TargetNotFound)));

    mesh.shutdown_all().await;
}

/// A call on a channel that went away resolves instead of hanging.
#[tokio::test]
async fn test_call_after_peer_shutdown() {
    let mut mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    let provider = mesh.nodes[0]
        .node
        .provider("node-1", ServiceSelector::ByName("Lobby-1".into()))
        .await
        .unwrap();
    let owner = mesh.nodes.remove(1);
    owner.shutdown().await;
    mesh.nodes[0]
        .wait_connected_at_most(0, Duration::from_secs(10))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), provider.start())
        .await
        .expect("call must not hang");
    assert!(result.is_err());

    mesh.shutdown_all().await;
}
