//! Store key layout

use emuhost_proto::DeviceId;

/// Builds namespaced store keys
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn device(&self, id: &DeviceId) -> String {
        format!("{}device:{}", self.namespace, id)
    }

    pub fn user(&self, username: &str) -> String {
        format!("{}user:{}", self.namespace, username)
    }

    pub fn reserved_ports(&self) -> String {
        format!("{}ports:reserved", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keyspace::new("emuhost:");
        let id = DeviceId::for_username("alice");

        assert_eq!(keys.device(&id), "emuhost:device:alice-device");
        assert_eq!(keys.user("alice"), "emuhost:user:alice");
        assert_eq!(keys.reserved_ports(), "emuhost:ports:reserved");
        assert_eq!(Keyspace::default().reserved_ports(), "ports:reserved");
    }
}
