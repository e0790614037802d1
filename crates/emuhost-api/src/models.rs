use chrono::{DateTime, Utc};
use emuhost_control::{StatusReport, User};
use emuhost_proto::{DeviceId, DeviceRecord, DeviceStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    /// Service version
    pub version: String,
    /// Key-value store reachability (`ok` or `unavailable`)
    pub store: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Stable machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Sign-up request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignupRequest {
    pub username: String,
    /// Display name
    pub name: String,
    pub password: String,
}

/// Login request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response; the token is also returned in the `Authorization` header
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserResponse,
}

/// Public view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub username: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            username: user.username,
            name: user.name,
            created_at: user.created_at,
        }
    }
}

/// Profile update; omitted fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub password: Option<String>,
}

/// Accepted stop request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
}

/// Stored device merged with the live runtime status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusResponse {
    pub device: DeviceRecord,
    /// Trimmed output of the runtime status probe
    pub runtime_status: Option<String>,
    /// Why the runtime could not be queried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_error: Option<String>,
    /// `"<stored>: <runtime>"`, or just the stored status
    pub status: String,
}

impl From<StatusReport> for DeviceStatusResponse {
    fn from(report: StatusReport) -> Self {
        Self {
            device: report.device,
            runtime_status: report.runtime_status,
            runtime_error: report.runtime_error,
            status: report.status,
        }
    }
}
