//! Per-request dispatch to the caller's emulator
//!
//! Bodies are streamed in both directions. Dropping the inbound request future
//! drops the upstream request with it.

use axum::body::Body;
use emuhost_auth::AuthGate;
use emuhost_control::DeviceRegistry;
use emuhost_proto::{DeviceRecord, DeviceStatus, Identity};
use http::header::AUTHORIZATION;
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tracing::{debug, warn};

use crate::headers::{is_upgrade_request, strip_caller_credentials, strip_hop_by_hop};
use crate::RouteError;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the device containers publish their ports on
    pub upstream_host: String,
    pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct ProxyRouter {
    gate: AuthGate,
    registry: DeviceRegistry,
    client: Client<HttpConnector, Body>,
    config: ProxyConfig,
}

impl ProxyRouter {
    pub fn new(gate: AuthGate, registry: DeviceRegistry, config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            gate,
            registry,
            client,
            config,
        }
    }

    /// Authenticate, resolve the caller's device and forward the request to it
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, RouteError> {
        let identity = self.authenticate(req.headers())?;
        let record = self.resolve(&identity).await?;

        debug!(
            device_id = %record.device_id,
            port = record.port,
            method = %req.method(),
            path = %req.uri().path(),
            "Proxying request"
        );

        if is_upgrade_request(req.headers()) {
            self.forward_upgrade(req, &record).await
        } else {
            self.forward(req, &record).await
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, RouteError> {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        Ok(self.gate.verify(credential)?)
    }

    /// The identity's own device, provided it is serving
    pub async fn resolve(&self, identity: &Identity) -> Result<DeviceRecord, RouteError> {
        let id = identity.device_id();
        let record = self
            .registry
            .find(&id)
            .await
            .map_err(|e| RouteError::Registry(e.to_string()))?
            .ok_or_else(|| RouteError::NotFound(id.clone()))?;

        if record.status != DeviceStatus::Running {
            return Err(RouteError::DeviceNotReady {
                device_id: record.device_id,
                status: record.status,
            });
        }
        Ok(record)
    }

    fn upstream_uri(&self, port: u16, original: &Uri) -> Result<Uri, RouteError> {
        let path = original
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        format!("http://{}:{}{}", self.config.upstream_host, port, path)
            .parse()
            .map_err(|e: http::uri::InvalidUri| RouteError::BadRequest(e.to_string()))
    }

    async fn forward(
        &self,
        req: Request<Body>,
        record: &DeviceRecord,
    ) -> Result<Response<Body>, RouteError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(record.port, &parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        strip_caller_credentials(&mut parts.headers);

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| {
                warn!(
                    device_id = %record.device_id,
                    port = record.port,
                    "Upstream request failed: {}",
                    e
                );
                RouteError::Upstream(e.to_string())
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Relay a protocol upgrade: forward the handshake, then splice both
    /// upgraded connections together
    async fn forward_upgrade(
        &self,
        mut req: Request<Body>,
        record: &DeviceRecord,
    ) -> Result<Response<Body>, RouteError> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let (mut parts, _) = req.into_parts();
        parts.uri = self.upstream_uri(record.port, &parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_caller_credentials(&mut parts.headers);

        let mut response = self
            .client
            .request(Request::from_parts(parts, Body::empty()))
            .await
            .map_err(|e| {
                warn!(
                    device_id = %record.device_id,
                    port = record.port,
                    "Upstream upgrade failed: {}",
                    e
                );
                RouteError::Upstream(e.to_string())
            })?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(response.map(Body::new));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let device_id = record.device_id.clone();
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => {
                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((sent, received)) => debug!(
                            device_id = %device_id,
                            sent,
                            received,
                            "Upgraded connection closed"
                        ),
                        Err(e) => {
                            debug!(device_id = %device_id, "Upgraded connection ended: {}", e)
                        }
                    }
                }
                Err(e) => warn!(device_id = %device_id, "Upgrade handshake failed: {}", e),
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, Body::empty()))
    }
}
