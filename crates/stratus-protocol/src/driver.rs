//! Driver API wire types.
//!
//! Request: `DriverRequest` header (type, correlation id, target) + JSON body.
//! Response: `DriverResponse` header + body whose first byte is the status.
//! The payload after the status byte is only meaningful on success.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtocolError;

/// Closed set of driver API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverRequestType {
    GetServiceByUniqueId,
    GetServiceByName,
    ForceUpdateService,
    CheckServiceExists,
    GetCachedLogMessages,
    AddServiceTemplate,
    AddServiceRemoteInclusion,
    AddServiceDeployment,
    SetServiceLifeCycle,
    RestartService,
    KillService,
    RunCommand,
    IncludeWaitingTemplates,
    IncludeWaitingInclusions,
    DeployResources,
}

impl DriverRequestType {
    /// Whether the request changes state on the owning node.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            DriverRequestType::GetServiceByUniqueId
                | DriverRequestType::GetServiceByName
                | DriverRequestType::ForceUpdateService
                | DriverRequestType::CheckServiceExists
                | DriverRequestType::GetCachedLogMessages
        )
    }
}

/// Which service a request addresses. The unique id wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TargetSelector {
    pub fn by_id(unique_id: Uuid) -> Self {
        Self {
            unique_id: Some(unique_id),
            name: None,
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            unique_id: None,
            name: Some(name.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unique_id.is_none() && self.name.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRequestHeader {
    pub request_type: DriverRequestType,
    pub correlation_id: Uuid,
    #[serde(default)]
    pub target: TargetSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponseHeader {
    pub request_type: DriverRequestType,
    pub correlation_id: Uuid,
}

/// Status code, always the first byte of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverStatus {
    Success = 0,
    ServiceNotFound = 1,
}

impl DriverStatus {
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(DriverStatus::Success),
            1 => Ok(DriverStatus::ServiceNotFound),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Response body after the status byte was read.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverResponse {
    /// Success; holds the undecoded payload.
    Success(Bytes),
    /// The target service does not exist. Nothing after the status byte
    /// was read.
    ServiceNotFound,
}

impl DriverResponse {
    /// Read the status byte. On a non-success status the remainder of the
    /// body is left untouched.
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyResponse);
        }
        match DriverStatus::from_code(body[0])? {
            DriverStatus::Success => Ok(DriverResponse::Success(body.split_off(1))),
            DriverStatus::ServiceNotFound => Ok(DriverResponse::ServiceNotFound),
        }
    }

    /// Success body carrying a JSON payload.
    pub fn encode_success<T: Serialize>(payload: &T) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_vec(payload)?;
        let mut buf = BytesMut::with_capacity(1 + json.len());
        buf.put_u8(DriverStatus::Success.code());
        buf.extend_from_slice(&json);
        Ok(buf.freeze())
    }

    /// Success body for operations without a result.
    pub fn encode_empty_success() -> Bytes {
        Bytes::from_static(&[DriverStatus::Success as u8])
    }

    pub fn encode_not_found() -> Bytes {
        Bytes::from_static(&[DriverStatus::ServiceNotFound as u8])
    }
}

/// Decode a JSON success payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a JSON request body.
pub fn encode_request_body<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(body)?))
}

/// Decode a JSON request body.
pub fn decode_request_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}
