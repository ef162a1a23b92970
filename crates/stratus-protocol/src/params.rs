//! Protocol parameters -- the timing and sizing constants every node of a
//! cluster must agree on.
//!
//! Node-local tuning (chunk pacing, call timeout overrides) lives in the node
//! config; these values are its defaults and the hard wire limits.

use std::time::Duration;

/// A named set of protocol-level timing and sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Parameter set identifier, announced in the node hello.
    pub revision: u16,

    // -- Framing --
    /// Maximum encoded frame size in bytes (header + body).
    pub max_frame_bytes: usize,
    /// Maximum encoded header size in bytes.
    pub max_header_bytes: usize,

    // -- Chunk transfer --
    /// Payload bytes carried by one chunk packet.
    pub chunk_size: usize,
    /// The sender pauses after every `pacing_every`-th chunk.
    pub pacing_every: u32,
    /// Length of the pacing pause in milliseconds.
    pub pacing_delay_ms: u64,

    // -- Driver API --
    /// Upper bound of a driver call in milliseconds.
    pub driver_call_timeout_ms: u64,

    // -- Channels --
    /// Outbound packets a channel queues before `send` reports it full.
    pub channel_queue_depth: usize,
}

impl ProtocolParams {
    pub const fn driver_call_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_call_timeout_ms)
    }

    pub const fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

/// Revision 1 parameters.
///
/// 64 KiB chunks with a 50 ms pause every 50 chunks cap an unthrottled
/// template push at roughly 64 MiB/s per sender.
pub const PARAMS_V1: ProtocolParams = ProtocolParams {
    revision: 1,

    // Framing
    max_frame_bytes: 16 * 1024 * 1024,
    max_header_bytes: 64 * 1024,

    // Chunk transfer
    chunk_size: 64 * 1024,
    pacing_every: 50,
    pacing_delay_ms: 50,

    // Driver API
    driver_call_timeout_ms: 5_000,

    // Channels
    channel_queue_depth: 1024,
};

/// The parameter set this build speaks.
pub const CURRENT_PARAMS: &ProtocolParams = &PARAMS_V1;
