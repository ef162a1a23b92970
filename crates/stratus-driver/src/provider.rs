//! Typed facade over one remote service.
//!
//! Every operation comes in two shapes: `*_task` returns the awaitable
//! `DriverTask` with the full outcome, the plain method waits at most the
//! call timeout and falls back to a default when the owning node does not
//! answer. Reads report a missing service as `None`/`false`; mutations fail
//! with `DriverError::TargetNotFound`.
//!
//! Nothing here assumes a mutation took effect. Re-fetch a snapshot to
//! observe the new state.

use bytes::Bytes;
use serde::Serialize;
use stratus_protocol::{
    decode_payload, encode_request_body, DriverRequestType, ServiceDeployment,
    ServiceInfoSnapshot, ServiceLifeCycle, ServiceRemoteInclusion, ServiceTemplate,
    TargetSelector,
};
use uuid::Uuid;

use crate::client::{DriverClient, DriverTask};
use crate::{DeployResources, DriverError};

/// How the provider addresses its service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceSelector {
    ById(Uuid),
    ByName(String),
    /// A snapshot the caller already holds. `snapshot()` returns it as is.
    Cached(ServiceInfoSnapshot),
}

impl ServiceSelector {
    /// Target as sent on the wire.
    pub fn target(&self) -> TargetSelector {
        match self {
            ServiceSelector::ById(unique_id) => TargetSelector::by_id(*unique_id),
            ServiceSelector::ByName(name) => TargetSelector::by_name(name.clone()),
            ServiceSelector::Cached(snapshot) => TargetSelector::by_id(snapshot.unique_id()),
        }
    }
}

#[derive(Clone)]
pub struct SpecificServiceProvider {
    client: DriverClient,
    selector: ServiceSelector,
}

impl SpecificServiceProvider {
    pub fn new(client: DriverClient, selector: ServiceSelector) -> Self {
        Self { client, selector }
    }

    pub fn by_id(client: DriverClient, unique_id: Uuid) -> Self {
        Self::new(client, ServiceSelector::ById(unique_id))
    }

    pub fn by_name(client: DriverClient, name: impl Into<String>) -> Self {
        Self::new(client, ServiceSelector::ByName(name.into()))
    }

    pub fn cached(client: DriverClient, snapshot: ServiceInfoSnapshot) -> Self {
        Self::new(client, ServiceSelector::Cached(snapshot))
    }

    pub fn selector(&self) -> &ServiceSelector {
        &self.selector
    }

    /// Remote read; a missing service resolves to `Ok(None)`.
    fn read<T>(&self, request_type: DriverRequestType) -> DriverTask<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let task = self.client.call(
            request_type,
            self.selector.target(),
            Bytes::new(),
            |payload| decode_payload::<T>(&payload),
        );
        DriverTask::spawn(async move {
            match task.await {
                Ok(value) => Ok(Some(value)),
                Err(DriverError::TargetNotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn mutate(&self, request_type: DriverRequestType, body: Bytes) -> DriverTask<()> {
        self.client
            .call(request_type, self.selector.target(), body, |_| Ok(()))
    }

    fn mutate_with<B: Serialize>(&self, request_type: DriverRequestType, body: &B) -> DriverTask<()> {
        match encode_request_body(body) {
            Ok(body) => self.mutate(request_type, body),
            Err(e) => DriverTask::ready(Err(DriverError::Decode(e))),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn snapshot_task(&self) -> DriverTask<Option<ServiceInfoSnapshot>> {
        match &self.selector {
            ServiceSelector::Cached(snapshot) => DriverTask::ready(Ok(Some(snapshot.clone()))),
            ServiceSelector::ById(_) => self.read(DriverRequestType::GetServiceByUniqueId),
            ServiceSelector::ByName(_) => self.read(DriverRequestType::GetServiceByName),
        }
    }

    pub async fn snapshot(&self) -> Result<Option<ServiceInfoSnapshot>, DriverError> {
        self.snapshot_task().get_or(None).await
    }

    /// Always asks the owning node, even for a cached selector.
    pub fn force_update_task(&self) -> DriverTask<Option<ServiceInfoSnapshot>> {
        self.read(DriverRequestType::ForceUpdateService)
    }

    pub async fn force_update(&self) -> Result<Option<ServiceInfoSnapshot>, DriverError> {
        self.force_update_task().get_or(None).await
    }

    pub fn is_valid_task(&self) -> DriverTask<bool> {
        let task = self.read::<bool>(DriverRequestType::CheckServiceExists);
        DriverTask::spawn(async move { Ok(task.await?.unwrap_or(false)) })
    }

    pub async fn is_valid(&self) -> Result<bool, DriverError> {
        self.is_valid_task().get_or(false).await
    }

    pub fn cached_log_messages_task(&self) -> DriverTask<Option<Vec<String>>> {
        self.read(DriverRequestType::GetCachedLogMessages)
    }

    pub async fn cached_log_messages(&self) -> Result<Option<Vec<String>>, DriverError> {
        self.cached_log_messages_task().get_or(None).await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn add_service_template_task(&self, template: &ServiceTemplate) -> DriverTask<()> {
        self.mutate_with(DriverRequestType::AddServiceTemplate, template)
    }

    pub async fn add_service_template(&self, template: &ServiceTemplate) -> Result<(), DriverError> {
        self.add_service_template_task(template).get_or(()).await
    }

    pub fn add_service_remote_inclusion_task(
        &self,
        inclusion: &ServiceRemoteInclusion,
    ) -> DriverTask<()> {
        self.mutate_with(DriverRequestType::AddServiceRemoteInclusion, inclusion)
    }

    pub async fn add_service_remote_inclusion(
        &self,
        inclusion: &ServiceRemoteInclusion,
    ) -> Result<(), DriverError> {
        self.add_service_remote_inclusion_task(inclusion)
            .get_or(())
            .await
    }

    pub fn add_service_deployment_task(&self, deployment: &ServiceDeployment) -> DriverTask<()> {
        self.mutate_with(DriverRequestType::AddServiceDeployment, deployment)
    }

    pub async fn add_service_deployment(
        &self,
        deployment: &ServiceDeployment,
    ) -> Result<(), DriverError> {
        self.add_service_deployment_task(deployment).get_or(()).await
    }

    pub fn set_life_cycle_task(&self, life_cycle: ServiceLifeCycle) -> DriverTask<()> {
        self.mutate_with(DriverRequestType::SetServiceLifeCycle, &life_cycle)
    }

    pub async fn set_life_cycle(&self, life_cycle: ServiceLifeCycle) -> Result<(), DriverError> {
        self.set_life_cycle_task(life_cycle).get_or(()).await
    }

    pub fn start_task(&self) -> DriverTask<()> {
        self.set_life_cycle_task(ServiceLifeCycle::Running)
    }

    pub async fn start(&self) -> Result<(), DriverError> {
        self.set_life_cycle(ServiceLifeCycle::Running).await
    }

    pub fn stop_task(&self) -> DriverTask<()> {
        self.set_life_cycle_task(ServiceLifeCycle::Stopped)
    }

    pub async fn stop(&self) -> Result<(), DriverError> {
        self.set_life_cycle(ServiceLifeCycle::Stopped).await
    }

    pub fn delete_task(&self) -> DriverTask<()> {
        self.set_life_cycle_task(ServiceLifeCycle::Deleted)
    }

    pub async fn delete(&self) -> Result<(), DriverError> {
        self.set_life_cycle(ServiceLifeCycle::Deleted).await
    }

    pub fn restart_task(&self) -> DriverTask<()> {
        self.mutate(DriverRequestType::RestartService, Bytes::new())
    }

    pub async fn restart(&self) -> Result<(), DriverError> {
        self.restart_task().get_or(()).await
    }

    pub fn kill_task(&self) -> DriverTask<()> {
        self.mutate(DriverRequestType::KillService, Bytes::new())
    }

    pub async fn kill(&self) -> Result<(), DriverError> {
        self.kill_task().get_or(()).await
    }

    pub fn run_command_task(&self, command: &str) -> DriverTask<()> {
        self.mutate_with(DriverRequestType::RunCommand, &command)
    }

    pub async fn run_command(&self, command: &str) -> Result<(), DriverError> {
        self.run_command_task(command).get_or(()).await
    }

    pub fn include_waiting_templates_task(&self) -> DriverTask<()> {
        self.mutate(DriverRequestType::IncludeWaitingTemplates, Bytes::new())
    }

    pub async fn include_waiting_templates(&self) -> Result<(), DriverError> {
        self.include_waiting_templates_task().get_or(()).await
    }

    pub fn include_waiting_inclusions_task(&self) -> DriverTask<()> {
        self.mutate(DriverRequestType::IncludeWaitingInclusions, Bytes::new())
    }

    pub async fn include_waiting_inclusions(&self) -> Result<(), DriverError> {
        self.include_waiting_inclusions_task().get_or(()).await
    }

    pub fn deploy_resources_task(&self, remove_deployments: bool) -> DriverTask<()> {
        self.mutate_with(
            DriverRequestType::DeployResources,
            &DeployResources { remove_deployments },
        )
    }

    pub async fn deploy_resources(&self, remove_deployments: bool) -> Result<(), DriverError> {
        self.deploy_resources_task(remove_deployments)
            .get_or(())
            .await
    }
}
