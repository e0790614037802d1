//! In-process runtime for development without a Docker daemon

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use emuhost_proto::{DeviceId, DeviceSpec};
use std::sync::Arc;
use tracing::info;

use crate::{ContainerRuntime, RuntimeError};

const SIMULATED_STATUS: &str = "simulated";

#[derive(Debug, Clone)]
struct SimulatedContainer {
    port: u16,
    running: bool,
}

/// Tracks containers in memory; nothing is actually launched
#[derive(Clone, Default)]
pub struct SimulatedRuntime {
    containers: Arc<DashMap<String, SimulatedContainer>>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, device_id: &DeviceId) -> bool {
        self.containers
            .get(device_id.as_str())
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn port_of(&self, device_id: &DeviceId) -> Option<u16> {
        self.containers.get(device_id.as_str()).map(|c| c.port)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn start(
        &self,
        device_id: &DeviceId,
        port: u16,
        spec: &DeviceSpec,
    ) -> Result<(), RuntimeError> {
        match self.containers.entry(device_id.to_string()) {
            Entry::Occupied(_) => Err(RuntimeError::Failed(format!(
                "container name {} already in use",
                device_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(SimulatedContainer {
                    port,
                    running: true,
                });
                info!(
                    device_id = %device_id,
                    port,
                    android_api = %spec.android_api,
                    "Simulated emulator started"
                );
                Ok(())
            }
        }
    }

    async fn stop(&self, device_id: &DeviceId) -> Result<(), RuntimeError> {
        if let Some(mut container) = self.containers.get_mut(device_id.as_str()) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, device_id: &DeviceId) -> Result<(), RuntimeError> {
        self.containers.remove(device_id.as_str());
        Ok(())
    }

    async fn status(&self, device_id: &DeviceId) -> Result<String, RuntimeError> {
        if self.containers.contains_key(device_id.as_str()) {
            Ok(SIMULATED_STATUS.to_string())
        } else {
            Err(RuntimeError::NotFound(device_id.to_string()))
        }
    }
}
