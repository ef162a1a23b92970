//! Stratus Protocol -- packet model, wire codec, driver API wire types.
//!
//! Every packet carries a typed header (the variant doubles as the routing
//! tag) and an opaque binary body.
//! Wire format: 4-byte big-endian frame length, 4-byte big-endian header
//! length, serde JSON header, raw body.

pub mod channel;
pub mod codec;
pub mod driver;
pub mod packet;
pub mod params;
pub mod service;

pub use channel::{ChannelError, MemoryChannel, PacketChannel};
pub use codec::PacketCodec;
pub use driver::*;
pub use packet::*;
pub use params::{ProtocolParams, CURRENT_PARAMS, PARAMS_V1};
pub use service::*;

/// Maximum encoded frame size (sourced from current parameters).
pub const MAX_FRAME_BYTES: usize = PARAMS_V1.max_frame_bytes;

/// Maximum encoded header size (sourced from current parameters).
pub const MAX_HEADER_BYTES: usize = PARAMS_V1.max_header_bytes;

/// Default chunk payload size (sourced from current parameters).
pub const CHUNK_SIZE: usize = PARAMS_V1.chunk_size;

/// Identifier of a packet channel, unique within one process.
pub type ChannelId = u64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("header too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: usize, max: usize },
    #[error("header length {header} exceeds frame length {frame}")]
    HeaderOutOfBounds { header: usize, frame: usize },
    #[error("unknown driver status code {0}")]
    UnknownStatus(u8),
    #[error("empty driver response body")]
    EmptyResponse,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
