//! Stratus Driver -- remote control of a service through its owning node.
//!
//! `DriverClient` turns a packet channel into correlated request/response
//! calls with a timeout. `SpecificServiceProvider` is the typed facade over
//! one service. `server` answers those requests on the owning node.

use serde::{Deserialize, Serialize};
use stratus_protocol::{ChannelError, ProtocolError};

pub mod client;
pub mod provider;
pub mod server;

pub use client::{DriverClient, DriverTask};
pub use provider::{ServiceSelector, SpecificServiceProvider};
pub use server::{dispatch_request, ServiceBackend};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("target service not found")]
    TargetNotFound,
    #[error("driver call timed out")]
    TimedOut,
    #[error("transport error: {0}")]
    Transport(#[from] ChannelError),
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),
    #[error("driver call abandoned")]
    Closed,
}

/// Body of a `DeployResources` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResources {
    pub remove_deployments: bool,
}
