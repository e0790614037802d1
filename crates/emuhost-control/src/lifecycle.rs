//! Device provisioning and teardown
//!
//! Registration runs as a saga: every completed step pushes its inverse and a
//! failure unwinds them in reverse, so a failed start leaves neither a record
//! nor a reserved port behind. Teardown runs in a tracked background task
//! whose failure is written back to the device status.

use emuhost_proto::{
    DeviceId, DeviceRecord, DeviceSpec, DeviceStatus, Identity, InvalidTransition, ValidationError,
};
use emuhost_runtime::{with_timeout, ContainerRuntime, RuntimeError, RuntimeTimeouts};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ports::{PortAllocator, PortError};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::retry::RetryPolicy;
use crate::task_tracker::TaskTracker;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("device {0} already exists")]
    AlreadyExists(DeviceId),

    #[error("device {0} not found")]
    NotFound(DeviceId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no free port available")]
    PortSpaceExhausted,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("store error: {0}")]
    Store(String),
}

impl From<PortError> for LifecycleError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Exhausted { .. } => LifecycleError::PortSpaceExhausted,
            other => LifecycleError::Store(other.to_string()),
        }
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(id) => LifecycleError::AlreadyExists(id),
            RegistryError::NotFound(id) => LifecycleError::NotFound(id),
            RegistryError::InvalidTransition(t) => LifecycleError::InvalidTransition(t),
            other => LifecycleError::Store(other.to_string()),
        }
    }
}

/// Stored state merged with what the runtime reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub device: DeviceRecord,
    /// Trimmed runtime output, if the runtime answered with anything
    pub runtime_status: Option<String>,
    pub runtime_error: Option<String>,
    /// `"<stored>: <runtime>"` or just `"<stored>"`
    pub status: String,
}

impl StatusReport {
    fn merge(device: DeviceRecord, runtime: Result<String, RuntimeError>) -> Self {
        let (runtime_status, runtime_error) = match runtime {
            Ok(output) => {
                let trimmed = output.trim();
                if trimmed.is_empty() {
                    (None, None)
                } else {
                    (Some(trimmed.to_string()), None)
                }
            }
            Err(e) => (None, Some(e.to_string())),
        };

        let status = match &runtime_status {
            Some(live) => format!("{}: {}", device.status, live),
            None => device.status.to_string(),
        };

        Self {
            device,
            runtime_status,
            runtime_error,
            status,
        }
    }
}

/// Inverse of a completed provisioning step
#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    ReleasePort(u16),
    DeleteRecord(DeviceId),
    TeardownContainer(DeviceId),
}

#[derive(Debug, Default)]
struct Saga {
    undo: Vec<Compensation>,
}

impl Saga {
    fn push(&mut self, step: Compensation) {
        self.undo.push(step);
    }

    /// Run every inverse in reverse order. A port is only released once the
    /// record pointing at it is gone.
    async fn rollback(self, coordinator: &LifecycleCoordinator, reason: &str) {
        let mut record_retained = false;

        for step in self.undo.into_iter().rev() {
            warn!(step = ?step, reason, "Compensating failed registration");
            match step {
                Compensation::TeardownContainer(id) => {
                    if let Err(e) = coordinator.teardown_container(&id).await {
                        warn!(device_id = %id, "Best-effort container removal failed: {}", e);
                    }
                }
                Compensation::DeleteRecord(id) => {
                    if let Err(e) = coordinator.registry.delete(&id).await {
                        error!(device_id = %id, "Failed to delete record during rollback: {}", e);
                        record_retained = true;
                        if let Err(mark) = coordinator.registry.mark_error(&id, reason).await {
                            error!(
                                device_id = %id,
                                "Failed to mark device error during rollback: {}", mark
                            );
                        }
                    }
                }
                Compensation::ReleasePort(port) => {
                    if record_retained {
                        warn!(port, "Keeping port reserved, record still present");
                    } else if let Err(e) = coordinator.ports.release(port).await {
                        error!(port, "Failed to release port during rollback: {}", e);
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct LifecycleCoordinator {
    ports: PortAllocator,
    registry: DeviceRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    timeouts: RuntimeTimeouts,
    tasks: Arc<TaskTracker>,
    failure_retry: RetryPolicy,
}

impl LifecycleCoordinator {
    pub fn new(
        ports: PortAllocator,
        registry: DeviceRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        timeouts: RuntimeTimeouts,
    ) -> Self {
        Self {
            ports,
            registry,
            runtime,
            timeouts,
            tasks: Arc::new(TaskTracker::new()),
            failure_retry: RetryPolicy::default(),
        }
    }

    /// Backoff used when writing a teardown failure back to the store
    pub fn with_failure_retry(mut self, retry: RetryPolicy) -> Self {
        self.failure_retry = retry;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Reserve a port, register a `Pending` record and start the container.
    /// Any failure after a side effect is compensated before returning.
    pub async fn register_and_start(
        &self,
        identity: &Identity,
        spec: &DeviceSpec,
    ) -> Result<DeviceRecord, LifecycleError> {
        spec.validate()?;
        let id = identity.device_id();

        if let Some(existing) = self.registry.find(&id).await? {
            if existing.status != DeviceStatus::Deleted {
                return Err(LifecycleError::AlreadyExists(id));
            }
            self.finish_cleanup(&existing).await?;
        }

        let mut saga = Saga::default();

        let port = self.ports.reserve().await?;
        saga.push(Compensation::ReleasePort(port));

        let record = DeviceRecord::pending(&identity.username, port, spec);
        if let Err(e) = self.registry.register(&record).await {
            saga.rollback(self, &e.to_string()).await;
            return Err(e.into());
        }
        saga.push(Compensation::DeleteRecord(id.clone()));
        // A start that times out may still have created the container
        saga.push(Compensation::TeardownContainer(id.clone()));

        info!(device_id = %id, port, android_api = %record.android_api, "Starting device");
        let started = with_timeout(
            "start",
            self.timeouts.start,
            self.runtime.start(&id, port, spec),
        )
        .await;

        if let Err(e) = started {
            warn!(device_id = %id, "Device start failed: {}", e);
            saga.rollback(self, &e.to_string()).await;
            return Err(e.into());
        }

        match self.registry.update_status(&id, DeviceStatus::Running).await {
            Ok(running) => {
                info!(device_id = %id, port, "Device running");
                Ok(running)
            }
            Err(e) => {
                warn!(device_id = %id, "Could not mark device running: {}", e);
                saga.rollback(self, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Begin teardown of the caller's device. Returns the record as of the request;
    /// completion is observable through the stored status.
    pub async fn stop(&self, identity: &Identity) -> Result<DeviceRecord, LifecycleError> {
        let id = identity.device_id();
        let record = self.registry.get(&id).await?;

        match record.status {
            DeviceStatus::Running => {
                match self.registry.update_status(&id, DeviceStatus::Stopping).await {
                    Ok(stopping) => {
                        info!(device_id = %id, port = stopping.port, "Stopping device");
                        self.spawn_teardown(stopping.clone(), false);
                        Ok(stopping)
                    }
                    Err(RegistryError::InvalidTransition(t)) if t.from == DeviceStatus::Stopping => {
                        debug!(device_id = %id, "Stop raced with another stop");
                        Ok(self.registry.get(&id).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            DeviceStatus::Stopping if self.tasks.is_active(id.as_str()) => {
                debug!(device_id = %id, "Teardown already in flight");
                Ok(record)
            }
            DeviceStatus::Stopping => {
                // No local worker owns it; a previous teardown died or this
                // process restarted. Teardown steps are idempotent.
                info!(device_id = %id, "Resuming teardown");
                self.spawn_teardown(record.clone(), false);
                Ok(record)
            }
            DeviceStatus::Error => {
                info!(device_id = %id, "Retrying teardown of failed device");
                self.spawn_teardown(record.clone(), true);
                Ok(record)
            }
            DeviceStatus::Deleted => {
                self.finish_cleanup(&record).await?;
                Ok(record)
            }
            DeviceStatus::Pending => Err(LifecycleError::InvalidTransition(InvalidTransition {
                from: DeviceStatus::Pending,
                to: DeviceStatus::Stopping,
            })),
        }
    }

    pub async fn get_status(&self, identity: &Identity) -> Result<StatusReport, LifecycleError> {
        let id = identity.device_id();
        let device = self.registry.get(&id).await?;

        let runtime = with_timeout("status", self.timeouts.status, self.runtime.status(&id)).await;
        if let Err(e) = &runtime {
            debug!(device_id = %id, "Runtime status unavailable: {}", e);
        }

        Ok(StatusReport::merge(device, runtime))
    }

    /// Wait for in-flight teardowns; returns how many had to be aborted
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tasks.shutdown(grace).await
    }

    pub fn teardown_in_flight(&self, id: &DeviceId) -> bool {
        self.tasks.is_active(id.as_str())
    }

    fn spawn_teardown(&self, record: DeviceRecord, from_error: bool) {
        let id = record.device_id.clone();
        let coordinator = self.clone();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(coordinator.teardown(record, from_error))
                .catch_unwind()
                .await;

            let reason = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    warn!(device_id = %task_id, "Teardown failed: {}", e);
                    e.to_string()
                }
                Err(_) => {
                    error!(device_id = %task_id, "Teardown task panicked");
                    "teardown task panicked".to_string()
                }
            };
            coordinator.record_failure(&task_id, &reason).await;
        });

        self.tasks.register(id.to_string(), handle);
    }

    /// Write a teardown failure back as `Error`, retrying store failures.
    /// A record that is gone or already `Deleted` was finished elsewhere.
    async fn record_failure(&self, id: &DeviceId, reason: &str) {
        let policy = self.failure_retry;
        let mut attempt = 0;

        loop {
            match self.registry.mark_error(id, reason).await {
                Ok(_) => return,
                Err(RegistryError::NotFound(_)) => {
                    debug!(device_id = %id, "Record gone, nothing to mark");
                    return;
                }
                Err(RegistryError::InvalidTransition(t)) => {
                    debug!(device_id = %id, from = %t.from, "Device left teardown, not marking error");
                    return;
                }
                Err(e) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        device_id = %id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to record teardown error, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        device_id = %id,
                        attempts = policy.max_attempts,
                        "Giving up recording teardown error, device stays stopping: {}",
                        e
                    );
                    return;
                }
            }
        }
    }

    async fn teardown(&self, record: DeviceRecord, from_error: bool) -> Result<(), LifecycleError> {
        let id = record.device_id.clone();

        self.teardown_container(&id).await?;

        let finished = if from_error {
            record
        } else {
            match self.registry.update_status(&id, DeviceStatus::Deleted).await {
                Ok(deleted) => deleted,
                Err(RegistryError::NotFound(_)) => {
                    debug!(device_id = %id, "Record already removed");
                    return Ok(());
                }
                Err(RegistryError::InvalidTransition(t)) if t.from == DeviceStatus::Deleted => {
                    debug!(device_id = %id, "Device already marked deleted");
                    self.registry.get(&id).await?
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.finish_cleanup(&finished).await?;
        info!(device_id = %id, port = finished.port, "Device deleted");
        Ok(())
    }

    async fn teardown_container(&self, id: &DeviceId) -> Result<(), RuntimeError> {
        with_timeout("stop", self.timeouts.stop, self.runtime.stop(id)).await?;
        with_timeout("remove", self.timeouts.remove, self.runtime.remove(id)).await
    }

    /// Remove a record whose container is gone, then free its port. Only the
    /// caller that actually removed the record releases the port.
    async fn finish_cleanup(&self, record: &DeviceRecord) -> Result<(), LifecycleError> {
        if self.registry.delete_if_unchanged(record).await? {
            self.ports.release(record.port).await?;
        } else {
            debug!(device_id = %record.device_id, "Record changed before cleanup, leaving it");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DeviceStatus) -> DeviceRecord {
        let mut record = DeviceRecord::pending("alice", 21000, &DeviceSpec::new("pixel", "30"));
        record.status = status;
        record
    }

    #[test]
    fn test_status_merge_with_runtime_output() {
        let report = StatusReport::merge(
            record(DeviceStatus::Running),
            Ok("  READY\n".to_string()),
        );
        assert_eq!(report.status, "running: READY");
        assert_eq!(report.runtime_status.as_deref(), Some("READY"));
        assert!(report.runtime_error.is_none());
    }

    #[test]
    fn test_status_merge_without_runtime_output() {
        let empty = StatusReport::merge(record(DeviceStatus::Pending), Ok("\n".to_string()));
        assert_eq!(empty.status, "pending");
        assert!(empty.runtime_status.is_none());

        let unreachable = StatusReport::merge(
            record(DeviceStatus::Running),
            Err(RuntimeError::Timeout {
                operation: "status",
                after: Duration::from_secs(5),
            }),
        );
        assert_eq!(unreachable.status, "running");
        assert!(unreachable.runtime_error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_error_mapping() {
        let id = DeviceId::for_username("alice");

        assert!(matches!(
            LifecycleError::from(RegistryError::AlreadyExists(id.clone())),
            LifecycleError::AlreadyExists(_)
        ));
        assert!(matches!(
            LifecycleError::from(RegistryError::NotFound(id)),
            LifecycleError::NotFound(_)
        ));
        assert!(matches!(
            LifecycleError::from(PortError::Exhausted {
                start: 1024,
                end: 1025
            }),
            LifecycleError::PortSpaceExhausted
        ));
    }
}
