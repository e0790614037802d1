//! Device records and provisioning requests

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::status::DeviceStatus;

const DEVICE_SUFFIX: &str = "-device";
const MAX_API_TAG_LEN: usize = 64;
const MAX_DEVICE_NAME_LEN: usize = 128;

/// Canonical device key
///
/// Always derived from the owner's username, never taken from a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn for_username(username: &str) -> Self {
        Self(format!("{}{}", username, DEVICE_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{field} is too long (max {max} characters)")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains invalid characters")]
    InvalidCharacters { field: &'static str },
}

/// Emulator flavour requested by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Emulated hardware profile, e.g. "Samsung Galaxy S10"
    pub device_name: String,
    /// Android API level, used as the emulator image tag
    pub android_api: String,
}

impl DeviceSpec {
    pub fn new(device_name: impl Into<String>, android_api: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            android_api: android_api.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.device_name.trim();
        if name.is_empty() {
            return Err(ValidationError::Missing("deviceName"));
        }
        if name.chars().count() > MAX_DEVICE_NAME_LEN {
            return Err(ValidationError::TooLong {
                field: "deviceName",
                max: MAX_DEVICE_NAME_LEN,
            });
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidCharacters {
                field: "deviceName",
            });
        }

        // Image tags: [A-Za-z0-9_.-], must not start with '.' or '-'
        let api = self.android_api.trim();
        if api.is_empty() {
            return Err(ValidationError::Missing("androidApi"));
        }
        if api.len() > MAX_API_TAG_LEN {
            return Err(ValidationError::TooLong {
                field: "androidApi",
                max: MAX_API_TAG_LEN,
            });
        }
        let valid_tag = api
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            && !api.starts_with(['.', '-']);
        if !valid_tag {
            return Err(ValidationError::InvalidCharacters {
                field: "androidApi",
            });
        }

        Ok(())
    }
}

/// Persisted device state, one per identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub owner: String,
    pub port: u16,
    /// Unix seconds when registration happened
    pub started_at: i64,
    pub android_api: String,
    pub device_name: String,
    pub status: DeviceStatus,
    /// Reason recorded when the device entered `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceRecord {
    /// A fresh `Pending` record for `owner` bound to `port`
    pub fn pending(owner: &str, port: u16, spec: &DeviceSpec) -> Self {
        Self {
            device_id: DeviceId::for_username(owner),
            owner: owner.to_string(),
            port,
            started_at: Utc::now().timestamp(),
            android_api: spec.android_api.trim().to_string(),
            device_name: spec.device_name.trim().to_string(),
            status: DeviceStatus::Pending,
            error: None,
        }
    }
}
