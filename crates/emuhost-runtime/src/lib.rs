//! Container runtime control plane
//!
//! The lifecycle layer talks to emulator containers only through
//! [`ContainerRuntime`]. Every call is expected to be wrapped in
//! [`with_timeout`] by the caller.

pub mod docker;
pub mod simulated;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use simulated::SimulatedRuntime;

use async_trait::async_trait;
use emuhost_proto::{DeviceId, DeviceSpec};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("runtime {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("container {0} not found")]
    NotFound(String),

    #[error("runtime failure: {0}")]
    Failed(String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start the emulator container for `device_id`, publishing it on `port`
    async fn start(
        &self,
        device_id: &DeviceId,
        port: u16,
        spec: &DeviceSpec,
    ) -> Result<(), RuntimeError>;

    /// Stop the container. Stopping an absent or stopped container succeeds.
    async fn stop(&self, device_id: &DeviceId) -> Result<(), RuntimeError>;

    /// Remove the container. Removing an absent container succeeds.
    async fn remove(&self, device_id: &DeviceId) -> Result<(), RuntimeError>;

    /// Free-form status text reported by the emulator
    async fn status(&self, device_id: &DeviceId) -> Result<String, RuntimeError>;
}

/// Per-operation deadlines for runtime calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeTimeouts {
    pub start: Duration,
    pub stop: Duration,
    pub remove: Duration,
    pub status: Duration,
}

impl Default for RuntimeTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(30),
            stop: Duration::from_secs(15),
            remove: Duration::from_secs(15),
            status: Duration::from_secs(5),
        }
    }
}

/// Run a runtime call under a deadline, mapping expiry to [`RuntimeError::Timeout`]
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), _> = with_timeout("start", Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(RuntimeError::Timeout {
                operation: "start",
                after: Duration::from_secs(30)
            })
        );
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let ok = with_timeout("status", Duration::from_secs(5), async {
            Ok::<_, RuntimeError>("running".to_string())
        })
        .await;
        assert_eq!(ok.unwrap(), "running");

        let err = with_timeout("stop", Duration::from_secs(5), async {
            Err::<(), _>(RuntimeError::Failed("boom".to_string()))
        })
        .await;
        assert_eq!(err, Err(RuntimeError::Failed("boom".to_string())));
    }
}
