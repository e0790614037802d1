pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use emuhost_auth::AuthGate;
use emuhost_control::{AccountService, LifecycleCoordinator};
use emuhost_router::ProxyRouter;
use emuhost_store::KvStore;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    pub accounts: AccountService,
    pub coordinator: LifecycleCoordinator,
    pub gate: AuthGate,
    pub proxy: ProxyRouter,
    /// Probed by the health check
    pub store: Arc<dyn KvStore>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Emuhost API",
        version = "0.1.0",
        description = "Per-user Android emulator provisioning and routing",
        contact(
            name = "Emuhost Team",
            email = "team@emuhost.dev"
        )
    ),
    paths(
        handlers::health_check,
        handlers::signup,
        handlers::login,
        handlers::get_current_user,
        handlers::update_current_user,
        handlers::register_device,
        handlers::stop_device,
        handlers::device_status,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::ErrorResponse,
            models::SignupRequest,
            models::LoginRequest,
            models::LoginResponse,
            models::UserResponse,
            models::UpdateProfileRequest,
            models::StopResponse,
            models::DeviceStatusResponse,
            emuhost_proto::DeviceSpec,
            emuhost_proto::DeviceRecord,
            emuhost_proto::DeviceStatus,
            emuhost_proto::DeviceId,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Sign-up, login and profile endpoints"),
        (name = "devices", description = "Emulator lifecycle endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS (browser clients on other origins)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    ///
    /// Paths that match no API route are proxied to the caller's device.
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/auth/signup", post(handlers::signup))
            .route("/api/auth/login", post(handlers::login))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route(
                "/api/auth/me",
                get(handlers::get_current_user).put(handlers::update_current_user),
            )
            .route("/api/device/register", post(handlers::register_device))
            .route("/api/device/stop", post(handlers::stop_device))
            .route("/api/device/status", get(handlers::device_status))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.gate.clone(),
                middleware::require_identity,
            ));

        let proxy_router = Router::new()
            .fallback(handlers::proxy_to_device)
            .with_state(self.state.clone());

        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router)
            .merge(proxy_router);

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            // Clients read the token from the login response header
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .expose_headers([header::AUTHORIZATION]);
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
