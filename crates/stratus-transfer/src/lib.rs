//! Stratus Transfer -- chunked binary transfer over packet channels.
//!
//! A large payload (a service template) moves as one chunk session:
//!   - chunk 0 carries the transfer header and the first slice,
//!   - chunks 1..n carry the next slices in order,
//!   - a zero-length terminal chunk carries the total size and SHA-256.
//!
//! Receivers stream each slice into a sink and only finalize it after the
//! terminal chunk verified; any failure discards the sink.

use std::time::Duration;

use sha2::{Digest, Sha256};
use stratus_protocol::{ChannelError, CURRENT_PARAMS};
use uuid::Uuid;

pub mod receiver;
pub mod sender;
pub mod sink;

pub use receiver::{ChunkReceiver, CompletedTransfer};
pub use sender::{ChunkSender, TransferSummary};
pub use sink::{FileSinkFactory, MemorySinkFactory, ResourceSink, SinkFactory};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("source read failed: {0}")]
    Source(#[source] std::io::Error),
    #[error("sink for {resource} failed: {source}")]
    Sink {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk emit failed: {0}")]
    Emit(#[from] ChannelError),
    #[error("session {session_id}: expected chunk {expected}, got {got}")]
    OutOfOrder {
        session_id: Uuid,
        expected: u32,
        got: u32,
    },
    #[error("session {0} is already in flight")]
    DuplicateSession(Uuid),
    #[error("chunk {index} for unknown session {session_id}")]
    UnknownSession { session_id: Uuid, index: u32 },
    #[error("session {0} has no transfer header on chunk 0")]
    MissingTransferHeader(Uuid),
    #[error("session {0} aborted by sender")]
    Aborted(Uuid),
    #[error("session {session_id} failed integrity check: {reason}")]
    Integrity { session_id: Uuid, reason: String },
}

/// Send-side throttle: sleep `delay` after every `every`-th chunk.
///
/// There is no receiver feedback; a slow receiver still buffers whatever
/// its channel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub every: u32,
    pub delay: Duration,
}

impl Pacing {
    /// No pauses at all.
    pub const fn none() -> Self {
        Self {
            every: 0,
            delay: Duration::ZERO,
        }
    }

    /// Whether the sender should pause after emitting `chunks_sent` chunks.
    pub fn should_pause(&self, chunks_sent: u32) -> bool {
        self.every > 0 && !self.delay.is_zero() && chunks_sent % self.every == 0
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            every: CURRENT_PARAMS.pacing_every,
            delay: CURRENT_PARAMS.pacing_delay(),
        }
    }
}

/// Compute the hex SHA-256 of data.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
