//! Service directory -- the services this node owns.
//!
//! Backs the driver API on the owning node. Process supervision is out of
//! scope: lifecycle changes are recorded, not executed.
//!
//! Lifecycle convention:
//!   PREPARED → RUNNING    start (also from STOPPED)
//!   RUNNING  → STOPPED    stop
//!   any      → RUNNING    restart, unless DELETED
//!   any      → DELETED    kill, delete
//! A DELETED service ignores further lifecycle changes.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use stratus_driver::ServiceBackend;
use stratus_protocol::{
    HostAndPort, ServiceDeployment, ServiceId, ServiceInfoSnapshot, ServiceLifeCycle,
    ServiceRemoteInclusion, ServiceTemplate,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Log lines kept per service.
const LOG_CAPACITY: usize = 256;

/// Entries kept per service in each template, inclusion, deployment and
/// command list. The oldest entry is dropped first.
const LIST_CAPACITY: usize = 256;

fn push_bounded<T>(items: &mut Vec<T>, item: T) {
    if items.len() >= LIST_CAPACITY {
        items.remove(0);
    }
    items.push(item);
}

fn extend_bounded<T>(items: &mut Vec<T>, more: Vec<T>) {
    items.extend(more);
    let excess = items.len().saturating_sub(LIST_CAPACITY);
    items.drain(..excess);
}

#[derive(Debug, Clone)]
struct ServiceRecord {
    snapshot: ServiceInfoSnapshot,
    waiting_templates: Vec<ServiceTemplate>,
    installed_templates: Vec<ServiceTemplate>,
    waiting_inclusions: Vec<ServiceRemoteInclusion>,
    installed_inclusions: Vec<ServiceRemoteInclusion>,
    deployments: Vec<ServiceDeployment>,
    commands: Vec<String>,
    log: VecDeque<String>,
}

impl ServiceRecord {
    fn new(snapshot: ServiceInfoSnapshot) -> Self {
        Self {
            snapshot,
            waiting_templates: Vec::new(),
            installed_templates: Vec::new(),
            waiting_inclusions: Vec::new(),
            installed_inclusions: Vec::new(),
            deployments: Vec::new(),
            commands: Vec::new(),
            log: VecDeque::new(),
        }
    }

    fn log(&mut self, line: String) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    /// Apply a lifecycle change following the convention above.
    fn transition(&mut self, target: ServiceLifeCycle) {
        use ServiceLifeCycle::*;

        let current = self.snapshot.life_cycle;
        let allowed = match (current, target) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Prepared | Stopped, Running) => true,
            (Running, Stopped) => true,
            _ => current == target,
        };
        if !allowed {
            tracing::debug!(
                service = %self.snapshot.name(),
                from = current.name(),
                to = target.name(),
                "services: lifecycle change ignored"
            );
            self.log(format!("[stratus] ignored {current} -> {target}"));
            return;
        }
        if current != target {
            tracing::info!(
                service = %self.snapshot.name(),
                from = current.name(),
                to = target.name(),
                "services: lifecycle changed"
            );
            self.log(format!("[stratus] {current} -> {target}"));
        }
        self.snapshot.life_cycle = target;
    }

    fn touch(&mut self) {
        self.snapshot.snapshot_time = Utc::now();
    }
}

/// In-memory directory of the services owned by one node.
#[derive(Debug)]
pub struct ServiceDirectory {
    node_unique_id: String,
    services: RwLock<HashMap<Uuid, ServiceRecord>>,
}

impl ServiceDirectory {
    pub fn new(node_unique_id: impl Into<String>) -> Self {
        Self {
            node_unique_id: node_unique_id.into(),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new PREPARED service of `task_name`, numbered after the
    /// highest existing id of that task.
    pub async fn create(&self, task_name: &str, address: HostAndPort) -> ServiceInfoSnapshot {
        let mut services = self.services.write().await;
        let task_service_id = services
            .values()
            .filter(|r| r.snapshot.service_id.task_name.eq_ignore_ascii_case(task_name))
            .map(|r| r.snapshot.service_id.task_service_id)
            .max()
            .unwrap_or(0)
            + 1;

        let now = Utc::now();
        let snapshot = ServiceInfoSnapshot {
            service_id: ServiceId {
                unique_id: Uuid::new_v4(),
                task_name: task_name.to_string(),
                task_service_id,
                node_unique_id: self.node_unique_id.clone(),
            },
            address,
            life_cycle: ServiceLifeCycle::Prepared,
            properties: serde_json::Map::new(),
            creation_time: now,
            snapshot_time: now,
        };
        services.insert(snapshot.unique_id(), ServiceRecord::new(snapshot.clone()));
        tracing::info!(
            service = %snapshot.name(),
            unique_id = %snapshot.unique_id(),
            services = services.len(),
            "services: service created"
        );
        snapshot
    }

    pub async fn get(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.services
            .read()
            .await
            .get(&unique_id)
            .map(|r| r.snapshot.clone())
    }

    pub async fn list(&self) -> Vec<ServiceInfoSnapshot> {
        self.services
            .read()
            .await
            .values()
            .map(|r| r.snapshot.clone())
            .collect()
    }

    /// Drop a service from the directory altogether.
    pub async fn remove(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.services
            .write()
            .await
            .remove(&unique_id)
            .map(|r| r.snapshot)
    }

    /// Append a line to a service's log buffer.
    pub async fn append_log(&self, unique_id: Uuid, line: impl Into<String>) -> bool {
        match self.services.write().await.get_mut(&unique_id) {
            Some(record) => {
                record.log(line.into());
                true
            }
            None => false,
        }
    }

    /// Templates waiting for the next `include_waiting_templates`.
    pub async fn waiting_templates(&self, unique_id: Uuid) -> Option<Vec<ServiceTemplate>> {
        self.read_record(unique_id, |r| r.waiting_templates.clone()).await
    }

    /// Templates already copied into the service.
    pub async fn installed_templates(&self, unique_id: Uuid) -> Option<Vec<ServiceTemplate>> {
        self.read_record(unique_id, |r| r.installed_templates.clone()).await
    }

    pub async fn waiting_inclusions(&self, unique_id: Uuid) -> Option<Vec<ServiceRemoteInclusion>> {
        self.read_record(unique_id, |r| r.waiting_inclusions.clone()).await
    }

    pub async fn installed_inclusions(&self, unique_id: Uuid) -> Option<Vec<ServiceRemoteInclusion>> {
        self.read_record(unique_id, |r| r.installed_inclusions.clone()).await
    }

    pub async fn deployments(&self, unique_id: Uuid) -> Option<Vec<ServiceDeployment>> {
        self.read_record(unique_id, |r| r.deployments.clone()).await
    }

    pub async fn commands(&self, unique_id: Uuid) -> Option<Vec<String>> {
        self.read_record(unique_id, |r| r.commands.clone()).await
    }

    async fn read_record<T>(&self, unique_id: Uuid, read: impl FnOnce(&ServiceRecord) -> T) -> Option<T> {
        self.services.read().await.get(&unique_id).map(read)
    }

    /// Run `mutate` on a service and refresh its snapshot time.
    async fn mutate(&self, unique_id: Uuid, mutate: impl FnOnce(&mut ServiceRecord)) -> Option<()> {
        let mut services = self.services.write().await;
        let record = services.get_mut(&unique_id)?;
        mutate(record);
        record.touch();
        Some(())
    }
}

#[async_trait]
impl ServiceBackend for ServiceDirectory {
    async fn find_by_unique_id(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.get(unique_id).await
    }

    async fn find_by_name(&self, name: &str) -> Option<ServiceInfoSnapshot> {
        self.services
            .read()
            .await
            .values()
            .find(|r| r.snapshot.name().eq_ignore_ascii_case(name))
            .map(|r| r.snapshot.clone())
    }

    async fn force_update(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        let mut services = self.services.write().await;
        let record = services.get_mut(&unique_id)?;
        record.touch();
        Some(record.snapshot.clone())
    }

    async fn cached_log_messages(&self, unique_id: Uuid) -> Option<Vec<String>> {
        self.read_record(unique_id, |r| r.log.iter().cloned().collect())
            .await
    }

    async fn add_service_template(&self, unique_id: Uuid, template: ServiceTemplate) -> Option<()> {
        self.mutate(unique_id, |r| {
            r.log(format!("[stratus] template {template} queued"));
            push_bounded(&mut r.waiting_templates, template);
        })
        .await
    }

    async fn add_service_remote_inclusion(
        &self,
        unique_id: Uuid,
        inclusion: ServiceRemoteInclusion,
    ) -> Option<()> {
        self.mutate(unique_id, |r| {
            r.log(format!("[stratus] inclusion {} queued", inclusion.url));
            push_bounded(&mut r.waiting_inclusions, inclusion);
        })
        .await
    }

    async fn add_service_deployment(
        &self,
        unique_id: Uuid,
        deployment: ServiceDeployment,
    ) -> Option<()> {
        self.mutate(unique_id, |r| {
            r.log(format!("[stratus] deployment to {} queued", deployment.template));
            push_bounded(&mut r.deployments, deployment);
        })
        .await
    }

    async fn set_life_cycle(&self, unique_id: Uuid, life_cycle: ServiceLifeCycle) -> Option<()> {
        self.mutate(unique_id, |r| r.transition(life_cycle)).await
    }

    async fn restart(&self, unique_id: Uuid) -> Option<()> {
        self.mutate(unique_id, |r| {
            if r.snapshot.life_cycle == ServiceLifeCycle::Deleted {
                r.log("[stratus] ignored restart of deleted service".into());
                return;
            }
            r.log("[stratus] restart".into());
            r.snapshot.life_cycle = ServiceLifeCycle::Running;
        })
        .await
    }

    async fn kill(&self, unique_id: Uuid) -> Option<()> {
        self.mutate(unique_id, |r| r.transition(ServiceLifeCycle::Deleted))
            .await
    }

    async fn run_command(&self, unique_id: Uuid, command: String) -> Option<()> {
        self.mutate(unique_id, |r| {
            r.log(format!("> {command}"));
            push_bounded(&mut r.commands, command);
        })
        .await
    }

    async fn include_waiting_templates(&self, unique_id: Uuid) -> Option<()> {
        self.mutate(unique_id, |r| {
            let waiting = std::mem::take(&mut r.waiting_templates);
            r.log(format!("[stratus] included {} template(s)", waiting.len()));
            extend_bounded(&mut r.installed_templates, waiting);
        })
        .await
    }

    async fn include_waiting_inclusions(&self, unique_id: Uuid) -> Option<()> {
        self.mutate(unique_id, |r| {
            let waiting = std::mem::take(&mut r.waiting_inclusions);
            r.log(format!("[stratus] included {} inclusion(s)", waiting.len()));
            extend_bounded(&mut r.installed_inclusions, waiting);
        })
        .await
    }

    async fn deploy_resources(&self, unique_id: Uuid, remove_deployments: bool) -> Option<()> {
        self.mutate(unique_id, |r| {
            r.log(format!("[stratus] deployed {} resource(s)", r.deployments.len()));
            if remove_deployments {
                r.deployments.clear();
            }
        })
        .await
    }
}
