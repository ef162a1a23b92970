//! Packets and their typed headers.
//!
//! The header variant is the routing tag: receivers dispatch on it instead of
//! looking up a channel string and probing a dynamic key/value header.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::driver::{DriverRequestHeader, DriverResponseHeader};
use crate::service::ServiceTemplate;

/// Wire name of the cluster template deploy channel.
pub const CHANNEL_TEMPLATE_DEPLOY: &str = "template_deploy";
/// Wire name of the driver API request channel.
pub const CHANNEL_DRIVER_REQUEST: &str = "driver_request";
/// Wire name of the driver API response channel.
pub const CHANNEL_DRIVER_RESPONSE: &str = "driver_response";
/// Wire name of the node hello channel.
pub const CHANNEL_NODE_HELLO: &str = "node_hello";

/// One framed unit on a packet channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Packet without a body.
    pub fn header_only(header: PacketHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Routing tag of this packet.
    pub fn channel(&self) -> &'static str {
        self.header.channel()
    }

    /// Correlation id of a driver request or response.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match &self.header {
            PacketHeader::DriverRequest(h) => Some(h.correlation_id),
            PacketHeader::DriverResponse(h) => Some(h.correlation_id),
            _ => None,
        }
    }
}

/// Typed header, one schema per routing tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "header", rename_all = "snake_case")]
pub enum PacketHeader {
    /// Chunk of a template pushed across the cluster.
    TemplateDeploy(ChunkHeader),
    DriverRequest(DriverRequestHeader),
    DriverResponse(DriverResponseHeader),
    /// First packet on an inter-node connection.
    NodeHello(NodeHello),
}

impl PacketHeader {
    pub fn channel(&self) -> &'static str {
        match self {
            PacketHeader::TemplateDeploy(_) => CHANNEL_TEMPLATE_DEPLOY,
            PacketHeader::DriverRequest(_) => CHANNEL_DRIVER_REQUEST,
            PacketHeader::DriverResponse(_) => CHANNEL_DRIVER_RESPONSE,
            PacketHeader::NodeHello(_) => CHANNEL_NODE_HELLO,
        }
    }
}

/// Header of one chunk of a chunk session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub session_id: Uuid,
    /// Position in the session, starting at 0.
    pub index: u32,
    /// Set on the last chunk only. A terminal chunk carries no payload
    /// unless it is also chunk 0 of an empty transfer.
    #[serde(default)]
    pub terminal: bool,
    /// The sender gave up; receivers discard the session.
    #[serde(default)]
    pub aborted: bool,
    /// Present on chunk 0 only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferHeader>,
    /// Payload length of the whole session, terminal chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Hex SHA-256 of the whole payload, terminal chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ChunkHeader {
    pub fn data(session_id: Uuid, index: u32) -> Self {
        Self {
            session_id,
            index,
            terminal: false,
            aborted: false,
            transfer: None,
            total_bytes: None,
            sha256: None,
        }
    }
}

/// What a chunk session transfers and how the receiver should install it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub template: ServiceTemplate,
    /// Clear the destination before installing the new content.
    #[serde(default)]
    pub pre_clear: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TransferHeader {
    pub fn new(template: ServiceTemplate, pre_clear: bool) -> Self {
        Self {
            template,
            pre_clear,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Identity announcement, the first packet each side sends on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHello {
    pub unique_id: String,
    pub revision: u16,
}
