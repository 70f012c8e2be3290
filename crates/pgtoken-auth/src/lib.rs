//! OAuth client-credentials token acquisition for managed PostgreSQL
//!
//! Exchanges a service principal's client id/secret for a short-lived access
//! token that the database accepts as a password. The crate has no knowledge
//! of scheduling or of where the token ends up; it only answers "give me a
//! valid token now" and classifies every failure as transient or permanent.
//!
//! Flow:
//! 1. `TokenClient::fetch()` POSTs `grant_type=client_credentials`
//! 2. The response is validated and its lifetime resolved from `expires_in`
//!    and, for JWT access tokens, the `exp` claim (`claims::jwt_expiry`)
//! 3. The result is a `Token` whose expiry already has clock skew removed

pub mod claims;
pub mod client;
pub mod error;
pub mod token;

pub use claims::jwt_expiry;
pub use client::{ClientAuthMethod, DEFAULT_SCOPE, TokenClient, TokenClientConfig, TokenResponse};
pub use error::{AuthError, AuthErrorKind, Result};
pub use token::{Token, unix_now_ms};
