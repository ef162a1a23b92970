//! Stratus Cluster -- the set of known nodes and their packet channels.
//!
//! Membership is replaced from full topology snapshots; there is no
//! election or voting. Node ids compare case-insensitively.

pub mod node;
pub mod registry;

pub use node::{normalize_id, ClusterNode, NodeDescriptor};
pub use registry::{BroadcastReport, NodeRegistry, ReconcileReport};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node {0} is not part of the cluster")]
    UnknownNode(String),
    #[error("node {0} has no open channel")]
    NotConnected(String),
}
