//! Owning-node side of the driver API.
//!
//! `dispatch_request` resolves the target, runs the operation against a
//! `ServiceBackend` and builds the response packet. Every backend method
//! answers `None` when the service does not exist.

use async_trait::async_trait;
use bytes::Bytes;
use stratus_protocol::{
    decode_request_body, DriverRequestHeader, DriverRequestType, DriverResponse,
    DriverResponseHeader, Packet, PacketHeader, ServiceDeployment, ServiceInfoSnapshot,
    ServiceLifeCycle, ServiceRemoteInclusion, ServiceTemplate, TargetSelector,
};
use uuid::Uuid;

use crate::{DeployResources, DriverError};

#[async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn find_by_unique_id(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot>;

    async fn find_by_name(&self, name: &str) -> Option<ServiceInfoSnapshot>;

    /// Refresh the service's state and return the new snapshot.
    async fn force_update(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot>;

    async fn cached_log_messages(&self, unique_id: Uuid) -> Option<Vec<String>>;

    async fn add_service_template(&self, unique_id: Uuid, template: ServiceTemplate)
        -> Option<()>;

    async fn add_service_remote_inclusion(
        &self,
        unique_id: Uuid,
        inclusion: ServiceRemoteInclusion,
    ) -> Option<()>;

    async fn add_service_deployment(
        &self,
        unique_id: Uuid,
        deployment: ServiceDeployment,
    ) -> Option<()>;

    async fn set_life_cycle(&self, unique_id: Uuid, life_cycle: ServiceLifeCycle) -> Option<()>;

    async fn restart(&self, unique_id: Uuid) -> Option<()>;

    async fn kill(&self, unique_id: Uuid) -> Option<()>;

    async fn run_command(&self, unique_id: Uuid, command: String) -> Option<()>;

    async fn include_waiting_templates(&self, unique_id: Uuid) -> Option<()>;

    async fn include_waiting_inclusions(&self, unique_id: Uuid) -> Option<()>;

    async fn deploy_resources(&self, unique_id: Uuid, remove_deployments: bool) -> Option<()>;
}

/// Resolve a target. A unique id is authoritative: when set, the name is
/// never consulted.
async fn resolve<B: ServiceBackend + ?Sized>(
    backend: &B,
    target: &TargetSelector,
) -> Option<ServiceInfoSnapshot> {
    if target.is_empty() {
        return None;
    }
    match (target.unique_id, &target.name) {
        (Some(unique_id), _) => backend.find_by_unique_id(unique_id).await,
        (None, Some(name)) => backend.find_by_name(name).await,
        (None, None) => None,
    }
}

/// Answer one driver request.
///
/// Fails only when the request body cannot be decoded; such a request is
/// left unanswered.
pub async fn dispatch_request<B: ServiceBackend + ?Sized>(
    backend: &B,
    header: &DriverRequestHeader,
    body: &[u8],
) -> Result<Packet, DriverError> {
    let response_body = match resolve(backend, &header.target).await {
        None => DriverResponse::encode_not_found(),
        Some(service) => run(backend, header.request_type, service, body).await?,
    };

    tracing::debug!(
        correlation_id = %header.correlation_id,
        request_type = ?header.request_type,
        mutation = header.request_type.is_mutation(),
        status = response_body.first().copied().unwrap_or_default(),
        "driver: request answered"
    );

    Ok(Packet::new(
        PacketHeader::DriverResponse(DriverResponseHeader {
            request_type: header.request_type,
            correlation_id: header.correlation_id,
        }),
        response_body,
    ))
}

async fn run<B: ServiceBackend + ?Sized>(
    backend: &B,
    request_type: DriverRequestType,
    service: ServiceInfoSnapshot,
    body: &[u8],
) -> Result<Bytes, DriverError> {
    let id = service.unique_id();
    let outcome = match request_type {
        DriverRequestType::GetServiceByUniqueId | DriverRequestType::GetServiceByName => {
            return Ok(DriverResponse::encode_success(&service)?);
        }
        DriverRequestType::CheckServiceExists => {
            return Ok(DriverResponse::encode_success(&true)?);
        }
        DriverRequestType::ForceUpdateService => {
            return payload(backend.force_update(id).await);
        }
        DriverRequestType::GetCachedLogMessages => {
            return payload(backend.cached_log_messages(id).await);
        }
        DriverRequestType::AddServiceTemplate => {
            let template = decode_request_body(body)?;
            backend.add_service_template(id, template).await
        }
        DriverRequestType::AddServiceRemoteInclusion => {
            let inclusion = decode_request_body(body)?;
            backend.add_service_remote_inclusion(id, inclusion).await
        }
        DriverRequestType::AddServiceDeployment => {
            let deployment = decode_request_body(body)?;
            backend.add_service_deployment(id, deployment).await
        }
        DriverRequestType::SetServiceLifeCycle => {
            let life_cycle = decode_request_body(body)?;
            backend.set_life_cycle(id, life_cycle).await
        }
        DriverRequestType::RestartService => backend.restart(id).await,
        DriverRequestType::KillService => backend.kill(id).await,
        DriverRequestType::RunCommand => {
            let command = decode_request_body(body)?;
            backend.run_command(id, command).await
        }
        DriverRequestType::IncludeWaitingTemplates => backend.include_waiting_templates(id).await,
        DriverRequestType::IncludeWaitingInclusions => backend.include_waiting_inclusions(id).await,
        DriverRequestType::DeployResources => {
            let DeployResources { remove_deployments } = decode_request_body(body)?;
            backend.deploy_resources(id, remove_deployments).await
        }
    };

    Ok(match outcome {
        Some(()) => DriverResponse::encode_empty_success(),
        None => DriverResponse::encode_not_found(),
    })
}

fn payload<T: serde::Serialize>(value: Option<T>) -> Result<Bytes, DriverError> {
    match value {
        Some(value) => Ok(DriverResponse::encode_success(&value)?),
        None => Ok(DriverResponse::encode_not_found()),
    }
}
