use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use emuhost_control::ProfileUpdate;
use emuhost_proto::{DeviceRecord, DeviceSpec, Identity};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::models::*;
use crate::AppState;

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Key-value store unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (status, store) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!("Health check: store unreachable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    let health = HealthResponse {
        status: if status == StatusCode::OK {
            "healthy"
        } else {
            "degraded"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store.to_string(),
    };

    (status, Json(health))
}

/// Create an account
#[utoipa::path(
    post,
    path = "/api/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Account created", body = UserResponse),
        (status = 400, description = "Invalid username, name or password", body = ErrorResponse),
        (status = 409, description = "Username already taken", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn signup(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let Json(req) = payload?;
    debug!(username = %req.username, "Sign-up request");

    let user = state
        .accounts
        .signup(&req.username, &req.name, &req.password)
        .await?;

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Exchange username and password for a bearer token
///
/// The token is returned in the body and in the `Authorization` response header.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid username or password", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;

    let grant = state.accounts.login(&req.username, &req.password).await?;
    let header_value = HeaderValue::from_str(&grant.token)
        .map_err(|e| ApiError::internal(format!("Token is not a valid header value: {}", e)))?;

    let body = LoginResponse {
        token: grant.token,
        expires_at: grant.identity.expires_at,
        user: grant.user.into(),
    };

    Ok(([(header::AUTHORIZATION, header_value)], Json(body)).into_response())
}

/// Current user's profile
#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 404, description = "Account no longer exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn get_current_user(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state.accounts.get(&identity.username).await?;
    Ok(Json(user.into()))
}

/// Update display name and/or password
#[utoipa::path(
    put,
    path = "/api/auth/me",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Updated profile", body = UserResponse),
        (status = 400, description = "Invalid name or password", body = ErrorResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 404, description = "Account no longer exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn update_current_user(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, ApiError> {
    let Json(req) = payload?;
    if req.name.is_none() && req.password.is_none() {
        return Err(ApiError::validation("Nothing to update"));
    }

    let user = state
        .accounts
        .update_profile(
            &identity.username,
            ProfileUpdate {
                name: req.name,
                password: req.password,
            },
        )
        .await?;

    Ok(Json(user.into()))
}

/// Provision the caller's emulator
#[utoipa::path(
    post,
    path = "/api/device/register",
    request_body = DeviceSpec,
    responses(
        (status = 201, description = "Device started", body = DeviceRecord),
        (status = 400, description = "Invalid device spec", body = ErrorResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 409, description = "Caller already has a device", body = ErrorResponse),
        (status = 502, description = "Container runtime failed", body = ErrorResponse),
        (status = 503, description = "No free port", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "devices"
)]
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<DeviceSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<DeviceRecord>), ApiError> {
    let Json(spec) = payload?;
    info!(
        username = %identity.username,
        device_name = %spec.device_name,
        "Device registration requested"
    );

    let record = state
        .coordinator
        .register_and_start(&identity, &spec)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Begin teardown of the caller's emulator
///
/// Returns immediately; poll `/api/device/status` to observe completion.
#[utoipa::path(
    post,
    path = "/api/device/stop",
    responses(
        (status = 202, description = "Teardown accepted", body = StopResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 404, description = "Caller has no device", body = ErrorResponse),
        (status = 409, description = "Device is still starting", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "devices"
)]
pub async fn stop_device(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<(StatusCode, Json<StopResponse>), ApiError> {
    let record = state.coordinator.stop(&identity).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StopResponse {
            device_id: record.device_id,
            status: record.status,
        }),
    ))
}

/// Stored device state merged with the live runtime status
#[utoipa::path(
    get,
    path = "/api/device/status",
    responses(
        (status = 200, description = "Device status", body = DeviceStatusResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 404, description = "Caller has no device", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "devices"
)]
pub async fn device_status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    let report = state.coordinator.get_status(&identity).await?;
    Ok(Json(report.into()))
}

/// Everything outside the API goes to the caller's own emulator
pub async fn proxy_to_device(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, ApiError> {
    Ok(state.proxy.route(req).await?)
}
