//! Docker Engine runtime for emulator containers
//!
//! One container per device, named after the device id, running the
//! `<image_repository>:<android_api>` image with its web VNC port published
//! on the device's reserved host port.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceMapping, HostConfig, PortBinding};
use bollard::Docker;
use emuhost_proto::{DeviceId, DeviceSpec};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::{ContainerRuntime, RuntimeError};

/// File inside the emulator image holding its boot status
const STATUS_FILE: &str = "device_status";

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    pub image_repository: String,
    /// Container port serving the emulator web client
    pub service_port: u16,
    /// Host device passed through for hardware acceleration
    pub kvm_device: Option<String>,
    pub web_vnc: bool,
    /// Seconds the engine waits before killing a stopping container
    pub stop_grace_secs: i64,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            image_repository: "budtmo/docker-android".to_string(),
            service_port: 6080,
            kvm_device: Some("/dev/kvm".to_string()),
            web_vnc: true,
            stop_grace_secs: 10,
        }
    }
}

impl DockerRuntimeConfig {
    pub fn image_for(&self, spec: &DeviceSpec) -> String {
        format!("{}:{}", self.image_repository, spec.android_api.trim())
    }

    fn container_config(&self, port: u16, spec: &DeviceSpec) -> Config<String> {
        let service = format!("{}/tcp", self.service_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            service.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(service, HashMap::new());

        let devices = self.kvm_device.as_ref().map(|path| {
            vec![DeviceMapping {
                path_on_host: Some(path.clone()),
                path_in_container: Some(path.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            }]
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            devices,
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(self.image_for(spec)),
            env: Some(vec![
                format!("EMULATOR_DEVICE={}", spec.device_name.trim()),
                format!("WEB_VNC={}", self.web_vnc),
            ]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers
    pub async fn connect(config: DockerRuntimeConfig) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_failure)?;
        docker.ping().await.map_err(docker_failure)?;
        info!("Connected to Docker daemon");

        Ok(Self { docker, config })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image = %image, "Pulling emulator image");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => return Err(docker_failure(e)),
            }
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create(
        &self,
        device_id: &DeviceId,
        port: u16,
        spec: &DeviceSpec,
    ) -> Result<(), DockerError> {
        let options = CreateContainerOptions {
            name: device_id.as_str(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), self.config.container_config(port, spec))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(
        &self,
        device_id: &DeviceId,
        port: u16,
        spec: &DeviceSpec,
    ) -> Result<(), RuntimeError> {
        match self.create(device_id, port, spec).await {
            Ok(()) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Image not present locally
                self.pull_image(&self.config.image_for(spec)).await?;
                self.create(device_id, port, spec)
                    .await
                    .map_err(docker_failure)?;
            }
            Err(e) => return Err(docker_failure(e)),
        }

        self.docker
            .start_container(device_id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_failure)?;

        info!(device_id = %device_id, port, "Emulator container started");
        Ok(())
    }

    async fn stop(&self, device_id: &DeviceId) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.config.stop_grace_secs,
        };

        match self
            .docker
            .stop_container(device_id.as_str(), Some(options))
            .await
        {
            Ok(_) => {
                info!(device_id = %device_id, "Container stopped");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(device_id = %device_id, "Container already gone on stop");
                Ok(())
            }
            Err(e) => Err(docker_failure(e)),
        }
    }

    async fn remove(&self, device_id: &DeviceId) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(device_id.as_str(), Some(options))
            .await
        {
            Ok(_) => {
                info!(device_id = %device_id, "Container removed");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(docker_failure(e)),
        }
    }

    async fn status(&self, device_id: &DeviceId) -> Result<String, RuntimeError> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["cat".to_string(), STATUS_FILE.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match self
            .docker
            .create_exec(device_id.as_str(), exec_options)
            .await
        {
            Ok(exec) => exec,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(RuntimeError::NotFound(device_id.to_string())),
            Err(e) => return Err(docker_failure(e)),
        };

        let mut stdout = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(docker_failure)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(docker_failure)? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            debug!(
                                device_id = %device_id,
                                stderr = %String::from_utf8_lossy(&message),
                                "Status probe stderr"
                            );
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        Ok(stdout)
    }
}

fn docker_failure(e: DockerError) -> RuntimeError {
    RuntimeError::Failed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config() {
        let config = DockerRuntimeConfig::default();
        let spec = DeviceSpec::new("Samsung Galaxy S10", "11.0");
        let container = config.container_config(21000, &spec);

        assert_eq!(container.image.as_deref(), Some("budtmo/docker-android:11.0"));

        let env = container.env.unwrap();
        assert!(env.contains(&"EMULATOR_DEVICE=Samsung Galaxy S10".to_string()));
        assert!(env.contains(&"WEB_VNC=true".to_string()));

        let host = container.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["6080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("21000"));

        let devices = host.devices.unwrap();
        assert_eq!(devices[0].path_on_host.as_deref(), Some("/dev/kvm"));
    }

    #[test]
    fn test_kvm_passthrough_optional() {
        let config = DockerRuntimeConfig {
            kvm_device: None,
            image_repository: "registry.local/android".to_string(),
            ..Default::default()
        };
        let container = config.container_config(21000, &DeviceSpec::new("pixel", "30"));

        assert_eq!(container.image.as_deref(), Some("registry.local/android:30"));
        assert!(container.host_config.unwrap().devices.is_none());
    }
}
