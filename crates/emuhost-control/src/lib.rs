//! Device session control: port reservations, device records, lifecycle
//! orchestration and user accounts

pub mod accounts;
pub mod keys;
pub mod lifecycle;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod task_tracker;

pub use accounts::{AccountError, AccountService, LoginGrant, ProfileUpdate, User};
pub use keys::Keyspace;
pub use lifecycle::{LifecycleCoordinator, LifecycleError, StatusReport};
pub use ports::{PortAllocator, PortError};
pub use registry::{DeviceRegistry, RegistryError};
pub use retry::RetryPolicy;
pub use task_tracker::TaskTracker;
