//! Credential issuance, verification and password hashing

pub mod gate;
pub mod jwt;
pub mod password;

pub use gate::{AuthError, AuthGate};
pub use jwt::{AccessClaims, JwtTokenService, TokenError, TokenService, MIN_SECRET_LEN};
pub use password::{hash_password, verify_password, PasswordError};
