//! Bearer credential verification
//!
//! The gate accepts `Bearer <token>` or a bare token and turns it into an
//! [`Identity`]. Expiry is checked here on every call, independently of
//! whatever the token service validated.

use chrono::{DateTime, Utc};
use emuhost_proto::Identity;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::jwt::TokenService;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Credential expired")]
    Expired,
}

#[derive(Clone)]
pub struct AuthGate {
    tokens: Arc<dyn TokenService>,
}

impl AuthGate {
    pub fn new(tokens: Arc<dyn TokenService>) -> Self {
        Self { tokens }
    }

    pub fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        self.verify_at(credential, Utc::now())
    }

    pub fn verify_at(&self, credential: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let token = strip_bearer(credential).ok_or(AuthError::MissingCredential)?;

        let identity = self.tokens.verify(token).map_err(|e| {
            debug!("Credential rejected: {}", e);
            AuthError::InvalidCredential(e.to_string())
        })?;

        if identity.is_expired_at(now) {
            debug!(username = %identity.username, "Credential expired");
            return Err(AuthError::Expired);
        }

        Ok(identity)
    }
}

/// Extract the token from a header value, `None` when nothing usable is present
fn strip_bearer(credential: &str) -> Option<&str> {
    let credential = credential.trim();
    let token = match credential.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => credential,
    };
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
