//! Caller identity derived from a verified credential

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Authenticated principal
///
/// Built per request from a verified token and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub display_name: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        display_name: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            display_name: display_name.into(),
            issued_at,
            expires_at,
        }
    }

    /// An identity is only valid strictly before its expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// The one device this identity may own
    pub fn device_id(&self) -> DeviceId {
        DeviceId::for_username(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn identity(expires_in: Duration) -> Identity {
        let now = Utc::now();
        Identity::new("alice", "Alice", now, now + expires_in)
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let id = identity(Duration::hours(1));
        assert!(!id.is_expired_at(id.expires_at - Duration::seconds(1)));
        assert!(id.is_expired_at(id.expires_at));
        assert!(id.is_expired_at(id.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_device_id_is_derived_from_username() {
        let a = identity(Duration::hours(1));
        let mut b = identity(Duration::hours(2));
        b.display_name = "Someone Else".to_string();

        assert_eq!(a.device_id(), b.device_id());
        assert_eq!(a.device_id().as_str(), "alice-device");
    }
}
