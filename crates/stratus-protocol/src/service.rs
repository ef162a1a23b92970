//! Service model shared by owning nodes and remote callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a managed service.
///
/// Only the owning node's value is authoritative; remote callers observe it
/// through snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLifeCycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifeCycle {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceLifeCycle::Prepared => "PREPARED",
            ServiceLifeCycle::Running => "RUNNING",
            ServiceLifeCycle::Stopped => "STOPPED",
            ServiceLifeCycle::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ServiceLifeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    pub task_service_id: u32,
    /// Node that owns the service.
    pub node_unique_id: String,
}

impl ServiceId {
    /// Human-facing name, e.g. `Lobby-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Point-in-time read of a service. Immutable once received; re-fetch to
/// observe changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    pub service_id: ServiceId,
    pub address: HostAndPort,
    pub life_cycle: ServiceLifeCycle,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub creation_time: DateTime<Utc>,
    pub snapshot_time: DateTime<Utc>,
}

impl ServiceInfoSnapshot {
    pub fn unique_id(&self) -> Uuid {
        self.service_id.unique_id
    }

    pub fn name(&self) -> String {
        self.service_id.name()
    }
}

/// Template reference: `storage:prefix/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    #[serde(default = "default_storage")]
    pub storage: String,
}

fn default_storage() -> String {
    ServiceTemplate::LOCAL_STORAGE.into()
}

impl ServiceTemplate {
    pub const LOCAL_STORAGE: &'static str = "local";

    pub fn local(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: default_storage(),
        }
    }

    /// Path of the template below its storage root.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// Remote resource fetched into a service directory before start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    pub destination: String,
}

/// Copy of a service directory back into a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    #[serde(default)]
    pub excludes: Vec<String>,
}
