//! Inbound packet routing for one node.
//!
//! Every connection loop hands its packets to `Dispatcher::handle` in the
//! order they were read. Chunk sessions rely on that order; driver requests
//! are answered on their own task so a slow backend does not stall the
//! connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratus_cluster::{normalize_id, NodeRegistry, RegistryError};
use stratus_driver::{dispatch_request, DriverClient, ServiceBackend};
use stratus_protocol::{ChannelId, NodeHello, Packet, PacketChannel, PacketHeader, CURRENT_PARAMS};
use stratus_transfer::{ChunkReceiver, CompletedTransfer, SinkFactory, TransferError};
use tokio::sync::broadcast;

pub struct Dispatcher {
    local_id: String,
    registry: NodeRegistry,
    receiver: tokio::sync::Mutex<ChunkReceiver<Arc<dyn SinkFactory>>>,
    backend: Arc<dyn ServiceBackend>,
    clients: Mutex<HashMap<ChannelId, DriverClient>>,
    call_timeout: Duration,
    installed: broadcast::Sender<CompletedTransfer>,
}

impl Dispatcher {
    pub fn new(
        local_id: impl Into<String>,
        registry: NodeRegistry,
        sinks: Arc<dyn SinkFactory>,
        backend: Arc<dyn ServiceBackend>,
        call_timeout: Duration,
    ) -> Self {
        let (installed, _) = broadcast::channel(64);
        Self {
            local_id: local_id.into(),
            registry,
            receiver: tokio::sync::Mutex::new(ChunkReceiver::new(sinks)),
            backend,
            clients: Mutex::new(HashMap::new()),
            call_timeout,
            installed,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The packet this node introduces itself with on a new channel.
    pub fn hello(&self) -> Packet {
        Packet::header_only(PacketHeader::NodeHello(NodeHello {
            unique_id: self.local_id.clone(),
            revision: CURRENT_PARAMS.revision,
        }))
    }

    /// Subscribe to templates installed from the cluster.
    pub fn subscribe_installed(&self) -> broadcast::Receiver<CompletedTransfer> {
        self.installed.subscribe()
    }

    /// Route one inbound packet read from `channel`.
    ///
    /// Until the peer introduced itself with a hello, everything else on the
    /// channel is dropped.
    pub async fn handle(&self, channel: &Arc<dyn PacketChannel>, packet: Packet) {
        let channel_id = channel.channel_id();

        if let PacketHeader::NodeHello(hello) = &packet.header {
            self.handle_hello(channel, hello).await;
            return;
        }

        if self.registry.get_by_channel(channel_id).await.is_none() {
            tracing::debug!(
                channel_id,
                channel = packet.channel(),
                "dispatch: packet before hello, dropped"
            );
            return;
        }

        match packet.header {
            PacketHeader::TemplateDeploy(header) => {
                let result = self
                    .receiver
                    .lock()
                    .await
                    .handle_chunk(channel_id, header, packet.body)
                    .await;
                self.chunk_handled(result);
            }
            PacketHeader::DriverRequest(header) => {
                let backend = self.backend.clone();
                let channel = channel.clone();
                let body = packet.body;
                tokio::spawn(async move {
                    match dispatch_request(backend.as_ref(), &header, &body).await {
                        Ok(response) => {
                            if let Err(e) = channel.send(response) {
                                tracing::warn!(
                                    correlation_id = %header.correlation_id,
                                    "dispatch: driver response not sent: {e}"
                                );
                            }
                        }
                        Err(e) => tracing::warn!(
                            correlation_id = %header.correlation_id,
                            request_type = ?header.request_type,
                            "dispatch: undecodable driver request left unanswered: {e}"
                        ),
                    }
                });
            }
            PacketHeader::DriverResponse(_) => {
                let client = self.existing_client(channel_id);
                let delivered = match client {
                    Some(client) => client.handle_response(packet).await,
                    None => false,
                };
                if !delivered {
                    tracing::debug!(channel_id, "dispatch: unmatched driver response");
                }
            }
            PacketHeader::NodeHello(_) => {}
        }
    }

    async fn handle_hello(&self, channel: &Arc<dyn PacketChannel>, hello: &NodeHello) {
        let channel_id = channel.channel_id();

        if hello.revision != CURRENT_PARAMS.revision {
            tracing::warn!(
                node = %hello.unique_id,
                channel_id,
                revision = hello.revision,
                expected = CURRENT_PARAMS.revision,
                "dispatch: protocol revision mismatch, closing channel"
            );
            channel.close().await;
            return;
        }
        if normalize_id(&hello.unique_id) == normalize_id(&self.local_id) {
            tracing::warn!(channel_id, "dispatch: connected to self, closing channel");
            channel.close().await;
            return;
        }

        match self.registry.bind(&hello.unique_id, channel.clone()).await {
            Ok(Some(previous)) if previous.channel_id() != channel_id => {
                tracing::info!(
                    node = %hello.unique_id,
                    old_channel = previous.channel_id(),
                    channel_id,
                    "dispatch: node reconnected, closing previous channel"
                );
                self.channel_closed(previous.channel_id()).await;
                previous.close().await;
            }
            Ok(_) => {}
            Err(RegistryError::UnknownNode(node)) => {
                tracing::warn!(%node, channel_id, "dispatch: hello from unknown node, closing channel");
                channel.close().await;
            }
            Err(e) => {
                tracing::warn!(channel_id, "dispatch: bind failed: {e}");
                channel.close().await;
            }
        }
    }

    fn chunk_handled(&self, result: Result<Option<CompletedTransfer>, TransferError>) {
        match result {
            Ok(Some(completed)) => {
                tracing::info!(
                    resource = %completed.transfer.template,
                    session_id = %completed.session_id,
                    chunks = completed.chunks,
                    bytes = completed.total_bytes,
                    "dispatch: template installed"
                );
                let _ = self.installed.send(completed);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("dispatch: chunk rejected: {e}"),
        }
    }

    /// Forget everything tied to a channel that went away: the node
    /// binding, open chunk sessions and pending driver calls.
    pub async fn channel_closed(&self, channel_id: ChannelId) {
        let node = self.registry.unbind_channel(channel_id).await;
        let aborted = self.receiver.lock().await.abort_channel(channel_id).await;
        let client = self
            .clients
            .lock()
            .ok()
            .and_then(|mut clients| clients.remove(&channel_id));
        let failed_calls = match client {
            Some(client) => client.fail_pending().await,
            None => 0,
        };

        tracing::debug!(
            channel_id,
            node = %node.as_ref().map(|n| n.unique_id()).unwrap_or_default(),
            aborted_sessions = aborted,
            failed_calls,
            "dispatch: channel released"
        );
    }

    /// Driver client bound to `channel`, created on first use.
    pub fn driver_client(&self, channel: &Arc<dyn PacketChannel>) -> DriverClient {
        let channel_id = channel.channel_id();
        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients
            .entry(channel_id)
            .or_insert_with(|| DriverClient::with_timeout(channel.clone(), self.call_timeout))
            .clone()
    }

    /// Driver client for the channel currently bound to `node_id`.
    pub async fn driver_client_for(&self, node_id: &str) -> Result<DriverClient, RegistryError> {
        let node = self
            .registry
            .get(node_id)
            .await
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        let channel = node
            .channel()
            .ok_or_else(|| RegistryError::NotConnected(node.unique_id()))?;
        Ok(self.driver_client(&channel))
    }

    fn existing_client(&self, channel_id: ChannelId) -> Option<DriverClient> {
        self.clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(&channel_id).cloned())
    }

    /// Chunk sessions currently being received.
    pub async fn sessions_in_flight(&self) -> usize {
        self.receiver.lock().await.in_flight()
    }

    /// Abort every open chunk session. Used on shutdown.
    pub async fn abort_sessions(&self) {
        self.receiver.lock().await.abort_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceDirectory;
    use bytes::Bytes;
    use stratus_cluster::NodeDescriptor;
    use stratus_driver::SpecificServiceProvider;
    use stratus_protocol::{
        ChunkHeader, HostAndPort, MemoryChannel, ServiceLifeCycle, ServiceTemplate, TransferHeader,
    };
    use stratus_transfer::MemorySinkFactory;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        registry: NodeRegistry,
        sinks: MemorySinkFactory,
        directory: Arc<ServiceDirectory>,
    }

    async fn fixture(local: &str, peers: &[&str]) -> Fixture {
        let registry = NodeRegistry::new();
        let topology: Vec<NodeDescriptor> = peers.iter().map(|p| NodeDescriptor::new(*p)).collect();
        registry.reconcile(&topology).await;
        let sinks = MemorySinkFactory::new();
        let directory = Arc::new(ServiceDirectory::new(local));
        let dispatcher = Arc::new(Dispatcher::new(
            local,
            registry.clone(),
            Arc::new(sinks.clone()),
            directory.clone(),
            Duration::from_secs(2),
        ));
        Fixture {
            dispatcher,
            registry,
            sinks,
            directory,
        }
    }

    fn hello(id: &str) -> Packet {
        Packet::header_only(PacketHeader::NodeHello(NodeHello {
            unique_id: id.into(),
            revision: CURRENT_PARAMS.revision,
        }))
    }

    /// Pump packets arriving on `rx` into the dispatcher as `channel`.
    fn pump(dispatcher: Arc<Dispatcher>, channel: Arc<dyn PacketChannel>, mut rx: mpsc::Receiver<Packet>) {
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                dispatcher.handle(&channel, packet).await;
            }
        });
    }

    #[tokio::test]
    async fn test_hello_binds_known_node() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, _rx) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);

        f.dispatcher.handle(&channel, hello("NODE-2")).await;

        let node = f.registry.get_by_channel(7).await.unwrap();
        assert_eq!(node.unique_id(), "Node-2");
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_hello_from_unknown_node_closes_channel() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, _rx) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);

        f.dispatcher.handle(&channel, hello("Node-9")).await;

        assert!(!channel.is_open());
        assert_eq!(f.registry.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_chunks_before_hello_are_dropped() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, _rx) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);

        let mut header = ChunkHeader::data(uuid::Uuid::new_v4(), 0);
        header.transfer = Some(TransferHeader::new(ServiceTemplate::local("Lobby", "default"), false));
        f.dispatcher
            .handle(&channel, Packet::new(PacketHeader::TemplateDeploy(header), Bytes::from_static(b"x")))
            .await;

        assert_eq!(f.dispatcher.sessions_in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_template_deploy_installs_through_sink() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, _rx) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);
        f.dispatcher.handle(&channel, hello("Node-2")).await;
        let mut installed = f.dispatcher.subscribe_installed();

        let template = ServiceTemplate::local("Lobby", "default");
        let session = uuid::Uuid::new_v4();
        let mut first = ChunkHeader::data(session, 0);
        first.transfer = Some(TransferHeader::new(template.clone(), false));
        let mut last = ChunkHeader::data(session, 1);
        last.terminal = true;
        last.total_bytes = Some(5);
        last.sha256 = Some(stratus_transfer::checksum(b"hello"));

        f.dispatcher
            .handle(&channel, Packet::new(PacketHeader::TemplateDeploy(first), Bytes::from_static(b"hello")))
            .await;
        assert_eq!(f.dispatcher.sessions_in_flight().await, 1);
        f.dispatcher
            .handle(&channel, Packet::header_only(PacketHeader::TemplateDeploy(last)))
            .await;

        assert_eq!(f.sinks.get(&template).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(installed.recv().await.unwrap().transfer.template, template);
        assert_eq!(f.dispatcher.sessions_in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_channel_closed_aborts_sessions_and_unbinds() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, _rx) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);
        f.dispatcher.handle(&channel, hello("Node-2")).await;

        let mut first = ChunkHeader::data(uuid::Uuid::new_v4(), 0);
        first.transfer = Some(TransferHeader::new(ServiceTemplate::local("Lobby", "default"), false));
        f.dispatcher
            .handle(&channel, Packet::new(PacketHeader::TemplateDeploy(first), Bytes::from_static(b"part")))
            .await;

        f.dispatcher.channel_closed(7).await;

        assert_eq!(f.dispatcher.sessions_in_flight().await, 0);
        assert_eq!(f.sinks.discarded(), 1);
        assert!(f.sinks.is_empty());
        assert!(f.registry.get_by_channel(7).await.is_none());
    }

    #[tokio::test]
    async fn test_driver_call_between_two_dispatchers() {
        let a = fixture("Node-1", &["Node-2"]).await;
        let b = fixture("Node-2", &["Node-1"]).await;
        let service = b
            .directory
            .create("Lobby", HostAndPort { host: "10.0.0.2".into(), port: 44955 })
            .await;

        let ((a_side, a_rx), (b_side, b_rx)) = MemoryChannel::pair(1, 2, 64);
        let a_side: Arc<dyn PacketChannel> = Arc::new(a_side);
        let b_side: Arc<dyn PacketChannel> = Arc::new(b_side);
        a_side.send(a.dispatcher.hello()).unwrap();
        b_side.send(b.dispatcher.hello()).unwrap();
        pump(a.dispatcher.clone(), a_side.clone(), a_rx);
        pump(b.dispatcher.clone(), b_side.clone(), b_rx);

        // wait until a sees b
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while a.registry.connected_count().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "hello never bound");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        while b.registry.connected_count().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "hello never bound");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = a.dispatcher.driver_client_for("node-2").await.unwrap();
        let provider = SpecificServiceProvider::by_name(client, "Lobby-1");
        provider.start().await.unwrap();

        assert_eq!(
            b.directory.get(service.unique_id()).await.unwrap().life_cycle,
            ServiceLifeCycle::Running
        );
        let snapshot = provider.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.unique_id(), service.unique_id());
    }

    #[tokio::test]
    async fn test_channel_closed_fails_calls_in_flight() {
        let f = fixture("Node-1", &["Node-2"]).await;
        let (channel, mut outbound) = MemoryChannel::new(7, 8);
        let channel: Arc<dyn PacketChannel> = Arc::new(channel);
        f.dispatcher.handle(&channel, hello("Node-2")).await;

        let client = f.dispatcher.driver_client_for("Node-2").await.unwrap();
        let task = SpecificServiceProvider::by_name(client, "Lobby-1").restart_task();
        outbound.recv().await.unwrap();

        channel.close().await;
        f.dispatcher.channel_closed(7).await;

        let outcome = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("call should fail as soon as the channel is released");
        assert!(matches!(outcome, Err(stratus_driver::DriverError::Closed)));
    }

    #[tokio::test]
    async fn test_driver_client_for_disconnected_node() {
        let f = fixture("Node-1", &["Node-2"]).await;
        assert!(matches!(
            f.dispatcher.driver_client_for("Node-2").await,
            Err(RegistryError::NotConnected(_))
        ));
        assert!(matches!(
            f.dispatcher.driver_client_for("Node-3").await,
            Err(RegistryError::UnknownNode(_))
        ));
    }
}
