//! Bearer authentication for protected endpoints
//!
//! Verifies the `Authorization` header through the [`AuthGate`] and makes the
//! resulting [`Identity`] available to handlers as an `Extension`.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use emuhost_auth::AuthGate;
use emuhost_proto::Identity;

use crate::error::ApiError;

/// Reject the request unless it carries a valid, unexpired credential
///
/// Both `Bearer <token>` and a bare token are accepted. Nothing downstream
/// runs for a rejected request.
pub async fn require_identity(
    State(gate): State<AuthGate>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    let identity: Identity = gate.verify(credential)?;
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorResponse;
    use axum::{
        body::Body, http::Request as HttpRequest, http::StatusCode, middleware, routing::get,
        Extension, Router,
    };
    use chrono::{Duration, Utc};
    use emuhost_auth::{JwtTokenService, TokenService};
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"middleware_test_secret_0123456789";

    async fn whoami(Extension(identity): Extension<Identity>) -> String {
        identity.username
    }

    fn app(tokens: Arc<JwtTokenService>) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(
                AuthGate::new(tokens),
                require_identity,
            ))
    }

    fn tokens() -> Arc<JwtTokenService> {
        Arc::new(JwtTokenService::new(SECRET, "emuhost", Duration::hours(1)).unwrap())
    }

    async fn call(app: Router, authorization: Option<String>) -> (StatusCode, Vec<u8>) {
        let mut builder = HttpRequest::builder().uri("/whoami");
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_bearer_and_bare_tokens_accepted() {
        let tokens = tokens();
        let (token, _) = tokens.mint("alice", "Alice").unwrap();

        let (status, body) = call(app(tokens.clone()), Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"alice");

        let (status, body) = call(app(tokens), Some(token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"alice");
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let (status, body) = call(app(tokens()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("UNAUTHORIZED"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let tokens = tokens();
        let now = Utc::now();
        let stale = Identity::new(
            "alice",
            "Alice",
            now - Duration::hours(3),
            now - Duration::hours(1),
        );
        let token = tokens.issue(&stale).unwrap();

        let (status, body) = call(app(tokens), Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("TOKEN_EXPIRED"));
    }

    #[tokio::test]
    async fn test_foreign_token_rejected() {
        let other = Arc::new(
            JwtTokenService::new(b"another_secret_of_sufficient_size!", "emuhost", Duration::hours(1))
                .unwrap(),
        );
        let (token, _) = other.mint("alice", "Alice").unwrap();

        let (status, _) = call(app(tokens()), Some(token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
