//! Core types for the emulator hosting system
//!
//! Shared by every other crate: the caller [`Identity`], the per-identity
//! [`DeviceId`], persisted [`DeviceRecord`]s and the [`DeviceStatus`] state machine.

pub mod device;
pub mod identity;
pub mod status;

pub use device::{DeviceId, DeviceRecord, DeviceSpec, ValidationError};
pub use identity::Identity;
pub use status::{DeviceStatus, InvalidTransition};

/// Lowest port handed out to devices (inclusive)
pub const MIN_DEVICE_PORT: u16 = 1024;

/// Upper bound of the device port range (exclusive)
pub const MAX_DEVICE_PORT: u16 = 65535;
