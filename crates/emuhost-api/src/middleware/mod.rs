//! API Middleware
//!
//! Layers applied in front of the protected endpoints.

pub mod auth;

pub use auth::require_identity;
