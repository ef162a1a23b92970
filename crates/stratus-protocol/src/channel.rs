//! Packet channel contract and an in-process implementation.
//!
//! A channel is an ordered, reliable, bidirectional packet connection to one
//! remote endpoint. Sends on one channel are serialized by the channel;
//! sends on different channels are independent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::packet::Packet;
use crate::ChannelId;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ChannelId),
    #[error("channel {0} outbound queue is full")]
    QueueFull(ChannelId),
    #[error("channel {id} write failed: {reason}")]
    Write { id: ChannelId, reason: String },
}

#[async_trait]
pub trait PacketChannel: Send + Sync + fmt::Debug {
    fn channel_id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    /// Queue a packet without waiting for it to be written.
    fn send(&self, packet: Packet) -> Result<(), ChannelError>;

    /// Write a packet and wait until the transport accepted it.
    async fn send_sync(&self, packet: Packet) -> Result<(), ChannelError>;

    /// Close the channel. Further sends fail with `Closed`. Idempotent.
    async fn close(&self);
}

/// In-process channel: packets sent on it arrive on the paired receiver.
///
/// Two of them, crossed, form a bidirectional connection.
#[derive(Clone)]
pub struct MemoryChannel {
    id: ChannelId,
    tx: Arc<Mutex<Option<mpsc::Sender<Packet>>>>,
    open: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryChannel {
    /// Create a channel and the receiver its packets are delivered to.
    pub fn new(id: ChannelId, depth: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let channel = Self {
            id,
            tx: Arc::new(Mutex::new(Some(tx))),
            open: Arc::new(AtomicBool::new(true)),
        };
        (channel, rx)
    }

    /// Two crossed channels: packets sent on `a` arrive on the second
    /// receiver, packets sent on `b` on the first.
    #[allow(clippy::type_complexity)]
    pub fn pair(
        a_id: ChannelId,
        b_id: ChannelId,
        depth: usize,
    ) -> (
        (Self, mpsc::Receiver<Packet>),
        (Self, mpsc::Receiver<Packet>),
    ) {
        let (a, to_b) = Self::new(a_id, depth);
        let (b, to_a) = Self::new(b_id, depth);
        ((a, to_a), (b, to_b))
    }

    fn sender(&self) -> Result<mpsc::Sender<Packet>, ChannelError> {
        let guard = self.tx.lock().map_err(|_| ChannelError::Closed(self.id))?;
        guard.clone().ok_or(ChannelError::Closed(self.id))
    }
}

#[async_trait]
impl PacketChannel for MemoryChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        self.sender()?.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed(self.id),
        })
    }

    async fn send_sync(&self, packet: Packet) -> Result<(), ChannelError> {
        let tx = self.sender()?;
        tx.send(packet)
            .await
            .map_err(|_| ChannelError::Closed(self.id))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}
