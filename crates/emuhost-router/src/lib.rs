//! Identity-gated reverse proxy to per-user emulator containers
//!
//! The only way to reach a device is through the caller's verified identity:
//! the device id is derived from it, never read from the request.

pub mod headers;
pub mod proxy;

pub use proxy::{ProxyConfig, ProxyRouter};

use emuhost_auth::AuthError;
use emuhost_proto::{DeviceId, DeviceStatus};
use thiserror::Error;

/// Routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("no device registered for {0}")]
    NotFound(DeviceId),

    #[error("device {device_id} is {status}, not running")]
    DeviceNotReady {
        device_id: DeviceId,
        status: DeviceStatus,
    },

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("registry error: {0}")]
    Registry(String),
}
