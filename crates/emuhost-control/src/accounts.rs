//! User accounts: sign-up, login and profile updates

use chrono::{DateTime, Duration, Utc};
use emuhost_auth::{hash_password, verify_password, PasswordError, TokenError, TokenService};
use emuhost_proto::Identity;
use emuhost_store::{CasOutcome, KvStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::keys::Keyspace;
use crate::retry::RetryPolicy;

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MAX_NAME_LEN: usize = 128;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),

    #[error("user {0} already exists")]
    UserExists(String),

    #[error("user {0} not found")]
    NotFound(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("user {0} is being modified concurrently")]
    Contention(String),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("stored user is unreadable: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Persisted account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub password: Option<String>,
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: String,
    pub identity: Identity,
    pub user: User,
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    tokens: Arc<dyn TokenService>,
    token_ttl: Duration,
    retry: RetryPolicy,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        tokens: Arc<dyn TokenService>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            tokens,
            token_ttl,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn signup(
        &self,
        username: &str,
        name: &str,
        password: &str,
    ) -> Result<User, AccountError> {
        validate_username(username)?;
        let name = validate_name(name)?;
        validate_password(password)?;

        let user = User {
            username: username.to_string(),
            name,
            password_hash: hash_blocking(password.to_string()).await?,
            created_at: Utc::now(),
        };

        let key = self.keys.user(username);
        if !self.store.set_if_absent(&key, &encode(&user)?).await? {
            return Err(AccountError::UserExists(username.to_string()));
        }

        info!(username, "User signed up");
        Ok(user)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, AccountError> {
        let user = match self.find(username).await? {
            Some(user) => user,
            None => {
                debug!(username, "Login for unknown user");
                return Err(AccountError::InvalidCredentials);
            }
        };

        if !verify_blocking(password.to_string(), user.password_hash.clone()).await? {
            debug!(username, "Login with wrong password");
            return Err(AccountError::InvalidCredentials);
        }

        let now = Utc::now();
        let identity = Identity::new(&user.username, &user.name, now, now + self.token_ttl);
        let token = self.tokens.issue(&identity)?;

        info!(username, "User logged in");
        Ok(LoginGrant {
            token,
            identity,
            user,
        })
    }

    pub async fn get(&self, username: &str) -> Result<User, AccountError> {
        self.find(username)
            .await?
            .ok_or_else(|| AccountError::NotFound(username.to_string()))
    }

    pub async fn update_profile(
        &self,
        username: &str,
        update: ProfileUpdate,
    ) -> Result<User, AccountError> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let password_hash = match update.password {
            Some(password) => {
                validate_password(&password)?;
                Some(hash_blocking(password).await?)
            }
            None => None,
        };

        let key = self.keys.user(username);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .read_raw(username)
                .await?
                .ok_or_else(|| AccountError::NotFound(username.to_string()))?;

            let mut user = decode(&raw)?;
            if let Some(name) = &name {
                user.name = name.clone();
            }
            if let Some(hash) = &password_hash {
                user.password_hash = hash.clone();
            }

            match self
                .store
                .compare_and_swap(&key, &raw, &encode(&user)?)
                .await?
            {
                CasOutcome::Swapped => {
                    info!(username, "Profile updated");
                    return Ok(user);
                }
                CasOutcome::Missing => return Err(AccountError::NotFound(username.to_string())),
                CasOutcome::Mismatch => continue,
            }
        }

        Err(AccountError::Contention(username.to_string()))
    }

    async fn find(&self, username: &str) -> Result<Option<User>, AccountError> {
        match self.read_raw(username).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn read_raw(&self, username: &str) -> Result<Option<String>, AccountError> {
        let key = self.keys.user(username);
        Ok(self
            .retry
            .run("get_user", || self.store.get(&key))
            .await?)
    }
}

/// Usernames become container names, so they stay within `[A-Za-z0-9_.-]`
fn validate_username(username: &str) -> Result<(), AccountError> {
    let len = username.len();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(AccountError::Validation(format!(
            "username must be {}-{} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }

    let starts_alnum = username
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let allowed = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !starts_alnum || !allowed {
        return Err(AccountError::Validation(
            "username may only contain letters, digits, '_', '.' and '-'".to_string(),
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String, AccountError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AccountError::Validation("name is required".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN || name.chars().any(|c| c.is_control()) {
        return Err(AccountError::Validation("name is invalid".to_string()));
    }
    Ok(name.to_string())
}

fn validate_password(password: &str) -> Result<(), AccountError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AccountError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

async fn hash_blocking(password: String) -> Result<String, AccountError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AccountError::Internal(e.to_string()))?
        .map_err(AccountError::from)
}

async fn verify_blocking(password: String, hash: String) -> Result<bool, AccountError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AccountError::Internal(e.to_string()))?
        .map_err(AccountError::from)
}

fn encode(user: &User) -> Result<String, AccountError> {
    serde_json::to_string(user).map_err(|e| AccountError::Corrupt(e.to_string()))
}

fn decode(raw: &str) -> Result<User, AccountError> {
    serde_json::from_str(raw).map_err(|e| AccountError::Corrupt(e.to_string()))
}
