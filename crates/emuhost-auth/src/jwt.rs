//! JWT (JSON Web Token) handling

use chrono::{DateTime, Duration, Utc};
use emuhost_proto::Identity;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest accepted HMAC secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Claims carried by an access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessClaims {
    /// Subject (username)
    pub sub: String,
    /// Display name
    pub name: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl AccessClaims {
    pub fn from_identity(identity: &Identity, issuer: &str) -> Self {
        Self {
            sub: identity.username.clone(),
            name: identity.display_name.clone(),
            iat: identity.issued_at.timestamp(),
            exp: identity.expires_at.timestamp(),
            iss: issuer.to_string(),
        }
    }

    pub fn into_identity(self) -> Result<Identity, TokenError> {
        let issued_at = DateTime::<Utc>::from_timestamp(self.iat, 0).ok_or(TokenError::Malformed)?;
        let expires_at =
            DateTime::<Utc>::from_timestamp(self.exp, 0).ok_or(TokenError::Malformed)?;
        Ok(Identity::new(self.sub, self.name, issued_at, expires_at))
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("secret key must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,

    #[error("token claims are malformed")]
    Malformed,
}

/// Issues and verifies bearer credentials
///
/// `verify` checks integrity only. Expiry is left to [`crate::AuthGate`].
pub trait TokenService: Send + Sync {
    fn issue(&self, identity: &Identity) -> Result<String, TokenError>;

    fn verify(&self, token: &str) -> Result<Identity, TokenError>;
}

/// HMAC-SHA256 token service
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl JwtTokenService {
    pub fn new(secret: &[u8], issuer: impl Into<String>, ttl: Duration) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }

        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.set_issuer(&[issuer.as_str()]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build a fresh identity valid for the configured lifetime and sign it
    pub fn mint(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<(String, Identity), TokenError> {
        let now = Utc::now();
        let identity = Identity::new(username, display_name, now, now + self.ttl);
        let token = self.issue(&identity)?;
        Ok((token, identity))
    }
}

impl TokenService for JwtTokenService {
    fn issue(&self, identity: &Identity) -> Result<String, TokenError> {
        let claims = AccessClaims::from_identity(identity, &self.issuer);
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)?;
        data.claims.into_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890_abcdef";

    fn service() -> JwtTokenService {
        JwtTokenService::new(TEST_SECRET, "emuhost", Duration::hours(1)).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let service = service();
        let (token, identity) = service.mint("alice", "Alice").unwrap();

        let verified = service.verify(&token).unwrap();
        assert_eq!(verified.username, "alice");
        assert_eq!(verified.display_name, "Alice");
        assert_eq!(verified.expires_at.timestamp(), identity.expires_at.timestamp());
    }

    #[test]
    fn test_weak_secret_rejected() {
        let result = JwtTokenService::new(b"short", "emuhost", Duration::hours(1));
        assert!(matches!(result, Err(TokenError::WeakSecret)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = service().mint("alice", "Alice").unwrap();
        let other =
            JwtTokenService::new(b"another_secret_key_0987654321_zyx", "emuhost", Duration::hours(1))
                .unwrap();

        assert!(matches!(other.verify(&token), Err(TokenError::Jwt(_))));
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let (token, _) = service().mint("alice", "Alice").unwrap();
        let other = JwtTokenService::new(TEST_SECRET, "someone-else", Duration::hours(1)).unwrap();

        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let (token, _) = service().mint("alice", "Alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = AccessClaims {
            sub: "bob".to_string(),
            name: "Bob".to_string(),
            iat: 0,
            exp: i64::MAX / 2,
            iss: "emuhost".to_string(),
        };
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &forged_claims,
            &EncodingKey::from_secret(b"attacker_secret_attacker_secret_x"),
        )
        .unwrap();
        let forged_payload = forged.split('.').nth(1).unwrap();
        let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(service().verify(&tampered).is_err());
    }

    #[test]
    fn test_expired_token_still_verifies_signature() {
        let service = service();
        let now = Utc::now();
        let identity = Identity::new(
            "alice",
            "Alice",
            now - Duration::hours(2),
            now - Duration::hours(1),
        );
        let token = service.issue(&identity).unwrap();

        // Expiry is enforced by the gate, not here
        let verified = service.verify(&token).unwrap();
        assert!(verified.is_expired());
    }
}
