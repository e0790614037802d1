//! Server configuration file
//!
//! Loaded from YAML. Every section is optional and falls back to defaults, so
//! an empty file (or no file at all) yields a runnable configuration once a
//! secret key is supplied.

use anyhow::{bail, Context, Result};
use emuhost_auth::MIN_SECRET_LEN;
use emuhost_proto::MIN_DEVICE_PORT;
use emuhost_router::ProxyConfig;
use emuhost_runtime::{DockerRuntimeConfig, RuntimeTimeouts};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "emuhost.yml";

/// Secondary environment variable naming the config file
const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmuhostConfig {
    pub service_name: String,
    /// Allows the in-memory store and the simulated runtime
    pub development: bool,
    pub server: ServerSection,
    pub auth: AuthSection,
    pub store: StoreSection,
    pub ports: PortsSection,
    pub runtime: RuntimeSection,
    pub proxy: ProxySection,
}

impl Default for EmuhostConfig {
    fn default() -> Self {
        Self {
            service_name: "emuhost".to_string(),
            development: false,
            server: ServerSection::default(),
            auth: AuthSection::default(),
            store: StoreSection::default(),
            ports: PortsSection::default(),
            runtime: RuntimeSection::default(),
            proxy: ProxySection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub enable_cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// HS256 signing key, at least 32 bytes
    pub secret_key: Option<String>,
    pub issuer: String,
    pub token_ttl_hours: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret_key: None,
            issuer: "emuhost".to_string(),
            // 60 days
            token_ttl_hours: 1440,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Prefix for every key this service writes
    pub namespace: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "emuhost:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsSection {
    /// First port handed out (inclusive)
    pub start: u16,
    /// End of the range (exclusive)
    pub end: u16,
    /// Skip ports that cannot be bound on this host
    pub verify_bindable: bool,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            start: MIN_DEVICE_PORT,
            end: emuhost_proto::MAX_DEVICE_PORT,
            verify_bindable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    Docker,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub backend: RuntimeBackend,
    pub image_repository: String,
    pub service_port: u16,
    /// Host device passed into the container, `null` to disable
    pub kvm_device: Option<String>,
    pub web_vnc: bool,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub remove_timeout_secs: u64,
    pub status_timeout_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let docker = DockerRuntimeConfig::default();
        let timeouts = RuntimeTimeouts::default();
        Self {
            backend: RuntimeBackend::Docker,
            image_repository: docker.image_repository,
            service_port: docker.service_port,
            kvm_device: docker.kvm_device,
            web_vnc: docker.web_vnc,
            start_timeout_secs: timeouts.start.as_secs(),
            stop_timeout_secs: timeouts.stop.as_secs(),
            remove_timeout_secs: timeouts.remove.as_secs(),
            status_timeout_secs: timeouts.status.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub upstream_host: String,
    pub connect_timeout_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        let proxy = ProxyConfig::default();
        Self {
            upstream_host: proxy.upstream_host,
            connect_timeout_secs: proxy.connect_timeout.as_secs(),
        }
    }
}

impl EmuhostConfig {
    /// Pick the config file: explicit path, then `CONFIG_PATH`, then
    /// `./emuhost.yml` if it exists
    pub fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit
            .or_else(|| {
                std::env::var(CONFIG_PATH_ENV)
                    .ok()
                    .filter(|p| !p.trim().is_empty())
                    .map(PathBuf::from)
            })
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.is_file().then_some(local)
            })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }

    pub fn validate(&self) -> Result<()> {
        match self.auth.secret_key.as_deref() {
            None => bail!("auth.secret_key is required (or set EMUHOST_SECRET_KEY)"),
            Some(secret) if secret.len() < MIN_SECRET_LEN => bail!(
                "auth.secret_key must be at least {} bytes",
                MIN_SECRET_LEN
            ),
            Some(_) => {}
        }
        if self.auth.token_ttl_hours <= 0 {
            bail!("auth.token_ttl_hours must be positive");
        }

        if self.ports.start < MIN_DEVICE_PORT {
            bail!("ports.start must be at least {}", MIN_DEVICE_PORT);
        }
        if self.ports.start >= self.ports.end {
            bail!(
                "ports.start ({}) must be below ports.end ({})",
                self.ports.start,
                self.ports.end
            );
        }

        let timeouts = [
            ("runtime.start_timeout_secs", self.runtime.start_timeout_secs),
            ("runtime.stop_timeout_secs", self.runtime.stop_timeout_secs),
            ("runtime.remove_timeout_secs", self.runtime.remove_timeout_secs),
            ("runtime.status_timeout_secs", self.runtime.status_timeout_secs),
            ("proxy.connect_timeout_secs", self.proxy.connect_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if !self.development {
            if self.store.backend == StoreBackend::Memory {
                bail!("store.backend 'memory' requires development: true");
            }
            if self.runtime.backend == RuntimeBackend::Simulated {
                bail!("runtime.backend 'simulated' requires development: true");
            }
        }

        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid server.bind_addr: {}", self.server.bind_addr))
    }

    pub fn runtime_timeouts(&self) -> RuntimeTimeouts {
        RuntimeTimeouts {
            start: Duration::from_secs(self.runtime.start_timeout_secs),
            stop: Duration::from_secs(self.runtime.stop_timeout_secs),
            remove: Duration::from_secs(self.runtime.remove_timeout_secs),
            status: Duration::from_secs(self.runtime.status_timeout_secs),
        }
    }

    pub fn docker_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            image_repository: self.runtime.image_repository.clone(),
            service_port: self.runtime.service_port,
            kvm_device: self.runtime.kvm_device.clone(),
            web_vnc: self.runtime.web_vnc,
            ..DockerRuntimeConfig::default()
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            upstream_host: self.proxy.upstream_host.clone(),
            connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
        }
    }
}
