//! Mapping of domain errors onto HTTP responses
//!
//! Every failure leaves the API as `{ "error": ..., "code": ... }` with a
//! stable code per error kind.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use emuhost_auth::AuthError;
use emuhost_control::{AccountError, LifecycleError};
use emuhost_router::RouteError;
use tracing::error;

use crate::models::ErrorResponse;

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    fn store(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "Request failed: {}", self.message);
        }

        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: Some(self.code.to_string()),
            }),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let code = match e {
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::MissingCredential | AuthError::InvalidCredential(_) => "UNAUTHORIZED",
        };
        Self::new(StatusCode::UNAUTHORIZED, code, e.to_string())
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        let message = e.to_string();
        match e {
            AccountError::Validation(_) => Self::validation(message),
            AccountError::UserExists(_) => Self::new(StatusCode::CONFLICT, "USER_EXISTS", message),
            AccountError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "USER_NOT_FOUND", message)
            }
            AccountError::InvalidCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", message)
            }
            AccountError::Contention(_) | AccountError::Corrupt(_) | AccountError::Store(_) => {
                Self::store(message)
            }
            AccountError::Password(_) | AccountError::Token(_) | AccountError::Internal(_) => {
                Self::internal(message)
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        let message = e.to_string();
        match e {
            LifecycleError::Validation(_) => Self::validation(message),
            LifecycleError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "DEVICE_EXISTS", message)
            }
            LifecycleError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND", message)
            }
            LifecycleError::InvalidTransition(_) => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", message)
            }
            LifecycleError::PortSpaceExhausted => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "PORT_SPACE_EXHAUSTED",
                message,
            ),
            LifecycleError::Runtime(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "RUNTIME_FAILURE", message)
            }
            LifecycleError::Store(_) => Self::store(message),
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        let message = e.to_string();
        match e {
            RouteError::Unauthorized(auth) => auth.into(),
            RouteError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND", message)
            }
            RouteError::DeviceNotReady { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "DEVICE_NOT_READY", message)
            }
            RouteError::Upstream(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_UNAVAILABLE", message)
            }
            RouteError::BadRequest(_) => Self::validation(message),
            RouteError::Registry(_) => Self::store(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emuhost_proto::{DeviceId, DeviceStatus, InvalidTransition};

    #[test]
    fn test_auth_codes() {
        let expired = ApiError::from(AuthError::Expired);
        assert_eq!(expired.status, StatusCode::UNAUTHORIZED);
        assert_eq!(expired.code, "TOKEN_EXPIRED");

        let missing = ApiError::from(AuthError::MissingCredential);
        assert_eq!(missing.code, "UNAUTHORIZED");
    }

    #[test]
    fn test_lifecycle_codes() {
        let id = DeviceId::for_username("alice");

        let cases = [
            (
                LifecycleError::AlreadyExists(id.clone()),
                StatusCode::CONFLICT,
                "DEVICE_EXISTS",
            ),
            (
                LifecycleError::NotFound(id),
                StatusCode::NOT_FOUND,
                "DEVICE_NOT_FOUND",
            ),
            (
                LifecycleError::InvalidTransition(InvalidTransition {
                    from: DeviceStatus::Pending,
                    to: DeviceStatus::Stopping,
                }),
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
            ),
            (
                LifecycleError::PortSpaceExhausted,
                StatusCode::SERVICE_UNAVAILABLE,
                "PORT_SPACE_EXHAUSTED",
            ),
            (
                LifecycleError::Store("down".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
            ),
        ];

        for (error, status, code) in cases {
            let mapped = ApiError::from(error);
            assert_eq!(mapped.status, status);
            assert_eq!(mapped.code, code);
        }
    }

    #[test]
    fn test_route_codes() {
        let not_ready = ApiError::from(RouteError::DeviceNotReady {
            device_id: DeviceId::for_username("alice"),
            status: DeviceStatus::Pending,
        });
        assert_eq!(not_ready.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(not_ready.code, "DEVICE_NOT_READY");

        let upstream = ApiError::from(RouteError::Upstream("refused".to_string()));
        assert_eq!(upstream.status, StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.code, "UPSTREAM_UNAVAILABLE");

        let unauthorized = ApiError::from(RouteError::Unauthorized(AuthError::Expired));
        assert_eq!(unauthorized.code, "TOKEN_EXPIRED");
    }

    #[test]
    fn test_account_codes() {
        let exists = ApiError::from(AccountError::UserExists("alice".to_string()));
        assert_eq!(exists.status, StatusCode::CONFLICT);
        assert_eq!(exists.code, "USER_EXISTS");

        let bad_login = ApiError::from(AccountError::InvalidCredentials);
        assert_eq!(bad_login.status, StatusCode::UNAUTHORIZED);
        assert_eq!(bad_login.code, "INVALID_CREDENTIALS");
    }
}
