//! TCP packet channel -- one framed TCP connection per cluster peer.
//!
//! The write half belongs to a writer task fed by a bounded queue, so sends
//! on one channel are written in order. `send_sync` waits for the writer to
//! report the frame as written. The read half is handed out as a
//! `PacketReader` for the connection loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use stratus_protocol::{ChannelError, ChannelId, Packet, PacketChannel, PacketCodec, ProtocolError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

struct Outbound {
    packet: Packet,
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

pub struct TcpPacketChannel {
    id: ChannelId,
    peer: SocketAddr,
    tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    open: AtomicBool,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for TcpPacketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPacketChannel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Inbound side of a `TcpPacketChannel`.
pub struct PacketReader {
    id: ChannelId,
    frames: FramedRead<OwnedReadHalf, PacketCodec>,
    closed: watch::Receiver<bool>,
}

impl PacketReader {
    /// Next inbound packet. `None` once the peer hung up or the channel was
    /// closed locally.
    pub async fn next(&mut self) -> Option<Result<Packet, ProtocolError>> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            frame = self.frames.next() => frame,
            _ = self.closed.changed() => None,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }
}

impl TcpPacketChannel {
    /// Wrap a connected stream. Spawns the writer task.
    pub fn spawn(id: ChannelId, stream: TcpStream, queue_depth: usize) -> std::io::Result<(Arc<Self>, PacketReader)> {
        let peer = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(queue_depth.max(1));
        let (closed, closed_rx) = watch::channel(false);

        let channel = Arc::new(Self {
            id,
            peer,
            tx: Mutex::new(Some(tx)),
            open: AtomicBool::new(true),
            closed,
        });

        let writer = Arc::downgrade(&channel);
        tokio::spawn(async move {
            let mut frames = FramedWrite::new(write_half, PacketCodec);
            while let Some(Outbound { packet, ack }) = rx.recv().await {
                let result = frames.send(packet).await.map_err(|e| e.to_string());
                let failed = result.is_err();
                if let Err(reason) = &result {
                    tracing::warn!(channel_id = id, %peer, "tcp: write failed: {reason}");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                if failed {
                    break;
                }
            }
            let _ = frames.close().await;
            if let Some(channel) = writer.upgrade() {
                channel.mark_closed();
            }
            tracing::debug!(channel_id = id, %peer, "tcp: writer stopped");
        });

        let reader = PacketReader {
            id,
            frames: FramedRead::new(read_half, PacketCodec),
            closed: closed_rx,
        };
        Ok((channel, reader))
    }

    /// Connect to `addr` and wrap the stream.
    pub async fn connect(id: ChannelId, addr: &str, queue_depth: usize) -> std::io::Result<(Arc<Self>, PacketReader)> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(id, stream, queue_depth)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>, ChannelError> {
        let guard = self.tx.lock().map_err(|_| ChannelError::Closed(self.id))?;
        guard.clone().ok_or(ChannelError::Closed(self.id))
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let _ = self.closed.send(true);
    }
}

#[async_trait]
impl PacketChannel for TcpPacketChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        self.sender()?
            .try_send(Outbound { packet, ack: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull(self.id),
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed(self.id),
            })
    }

    async fn send_sync(&self, packet: Packet) -> Result<(), ChannelError> {
        let (ack, written) = oneshot::channel();
        self.sender()?
            .send(Outbound {
                packet,
                ack: Some(ack),
            })
            .await
            .map_err(|_| ChannelError::Closed(self.id))?;
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ChannelError::Write { id: self.id, reason }),
            Err(_) => Err(ChannelError::Closed(self.id)),
        }
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(channel_id = self.id, peer = %self.peer, "tcp: channel closed");
        }
        // Dropping the queue sender lets the writer drain and shut the socket.
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let _ = self.closed.send(true);
    }
}
