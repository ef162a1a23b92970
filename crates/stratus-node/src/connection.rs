//! Connection tasks -- accept loop, per-channel read loop, peer dialing.
//!
//! Each pair of nodes shares one channel. Only the node whose normalized id
//! sorts lower dials; the other side waits for the inbound connection.
//! Both sides open with a `NodeHello`, and the hello binds the channel to
//! the node in the registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use stratus_cluster::{normalize_id, ClusterNode, NodeRegistry};
use stratus_protocol::{ChannelId, Packet, PacketChannel, ProtocolError};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::dispatcher::Dispatcher;
use crate::tcp_channel::{PacketReader, TcpPacketChannel};

/// Upper bound for one TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

type PacketStream = BoxStream<'static, Result<Packet, ProtocolError>>;

pub(crate) struct Connections {
    pub(crate) dispatcher: Arc<Dispatcher>,
    registry: NodeRegistry,
    queue_depth: usize,
    next_channel_id: AtomicU64,
    /// Node keys with an outbound connection being set up or running.
    dialing: Mutex<HashSet<String>>,
    shutdown: broadcast::Sender<()>,
}

impl Connections {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        registry: NodeRegistry,
        queue_depth: usize,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            queue_depth,
            next_channel_id: AtomicU64::new(1),
            dialing: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub(crate) fn allocate_channel_id(&self) -> ChannelId {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn dialing(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.dialing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// True when this node is the one expected to dial `key`.
    fn dials(&self, key: &str) -> bool {
        normalize_id(key) > normalize_id(self.dispatcher.local_id())
    }

    /// Serve a TCP connection, inbound or outbound.
    pub(crate) fn spawn_tcp(self: &Arc<Self>, channel: Arc<TcpPacketChannel>, reader: PacketReader) {
        let connections = self.clone();
        let shutdown = self.subscribe_shutdown();
        tokio::spawn(async move {
            connections
                .run_connection(channel, tcp_packets(reader), shutdown)
                .await;
        });
    }

    /// Serve an in-process channel whose inbound packets arrive on `rx`.
    pub(crate) fn spawn_memory(self: &Arc<Self>, channel: Arc<dyn PacketChannel>, rx: mpsc::Receiver<Packet>) {
        let connections = self.clone();
        let shutdown = self.subscribe_shutdown();
        tokio::spawn(async move {
            connections
                .run_connection(channel, memory_packets(rx), shutdown)
                .await;
        });
    }

    /// Send our hello, then feed inbound packets to the dispatcher until the
    /// channel ends or the node shuts down.
    async fn run_connection(
        &self,
        channel: Arc<dyn PacketChannel>,
        mut packets: PacketStream,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let channel_id = channel.channel_id();

        if let Err(e) = channel.send(self.dispatcher.hello()) {
            tracing::warn!(channel_id, "connection: hello not sent: {e}");
        }

        loop {
            tokio::select! {
                next = packets.next() => match next {
                    Some(Ok(packet)) => self.dispatcher.handle(&channel, packet).await,
                    Some(Err(e)) => {
                        tracing::warn!(channel_id, "connection: undecodable frame, dropping connection: {e}");
                        break;
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
            // closed locally, e.g. a refused hello
            if !channel.is_open() {
                break;
            }
        }

        channel.close().await;
        self.dispatcher.channel_closed(channel_id).await;
        tracing::debug!(channel_id, "connection: closed");
    }

    /// Dial every known node this side is responsible for that has no
    /// channel yet. Returns the number of dials started.
    pub(crate) async fn dial_missing(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for node in self.registry.nodes().await {
            if node.is_connected() || !self.dials(node.key()) {
                continue;
            }
            if !self.dialing().insert(node.key().to_string()) {
                continue;
            }
            let connections = self.clone();
            let shutdown = self.subscribe_shutdown();
            tokio::spawn(async move { connections.dial(node, shutdown).await });
            started += 1;
        }
        started
    }

    /// Try the node's addresses in order and serve the first that connects.
    /// The node stays marked as dialing until that connection ends.
    async fn dial(self: Arc<Self>, node: Arc<ClusterNode>, shutdown: broadcast::Receiver<()>) {
        let key = node.key().to_string();
        let descriptor = node.descriptor();

        for address in &descriptor.addresses {
            let channel_id = self.allocate_channel_id();
            let connect = TcpPacketChannel::connect(channel_id, address, self.queue_depth);
            match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok((channel, reader))) => {
                    tracing::info!(node = %descriptor.unique_id, %address, channel_id, "connection: dialed node");
                    self.run_connection(channel, tcp_packets(reader), shutdown).await;
                    self.dialing().remove(&key);
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(node = %descriptor.unique_id, %address, "connection: dial failed: {e}");
                }
                Err(_) => {
                    tracing::debug!(node = %descriptor.unique_id, %address, "connection: dial timed out");
                }
            }
        }

        if descriptor.addresses.is_empty() {
            tracing::debug!(node = %descriptor.unique_id, "connection: node has no address");
        }
        self.dialing().remove(&key);
    }
}

fn tcp_packets(reader: PacketReader) -> PacketStream {
    futures::stream::unfold(reader, |mut reader| async move {
        reader.next().await.map(|item| (item, reader))
    })
    .boxed()
}

fn memory_packets(rx: mpsc::Receiver<Packet>) -> PacketStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|packet| (Ok(packet), rx))
    })
    .boxed()
}

/// Accept inbound connections until shutdown. `shutdown` must be
/// subscribed before the loop is spawned so an early signal is not lost.
pub(crate) async fn run_accept_loop(
    connections: Arc<Connections>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let channel_id = connections.allocate_channel_id();
                    match TcpPacketChannel::spawn(channel_id, stream, connections.queue_depth()) {
                        Ok((channel, reader)) => {
                            tracing::debug!(%addr, channel_id, "connection: accepted");
                            connections.spawn_tcp(channel, reader);
                        }
                        Err(e) => tracing::warn!(%addr, "connection: accepted socket unusable: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("connection: accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("connection: accept loop shutting down");
                break;
            }
        }
    }
}

/// Periodically dial nodes that lost or never had a channel.
pub(crate) async fn run_reconnect_loop(
    connections: Arc<Connections>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let started = connections.dial_missing().await;
                if started > 0 {
                    tracing::debug!(started, "connection: redialing nodes");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
