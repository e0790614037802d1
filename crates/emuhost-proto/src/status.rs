//! Device lifecycle state machine
//!
//! ```text
//! Pending ──► Running ──► Stopping ──► Deleted
//!    │           │           │
//!    └───────────┴───────────┴──► Error
//! ```
//!
//! Transitions never skip a step or go backwards. `Deleted` and `Error` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Registered, container start in progress
    Pending,
    /// Container confirmed started
    Running,
    /// Teardown requested
    Stopping,
    /// Container confirmed removed
    Deleted,
    /// A runtime operation failed; kept for diagnosis
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Running => "running",
            DeviceStatus::Stopping => "stopping",
            DeviceStatus::Deleted => "deleted",
            DeviceStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceStatus::Deleted | DeviceStatus::Error)
    }

    pub fn can_transition_to(&self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        match (self, next) {
            (Pending, Running) | (Running, Stopping) | (Stopping, Deleted) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition_to(&self, next: DeviceStatus) -> Result<DeviceStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
