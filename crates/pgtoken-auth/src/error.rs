//! Error types for token acquisition

use std::time::Duration;

/// Whether retrying the same request can be expected to help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Timeouts, network failures, 5xx, rate limiting
    Transient,
    /// Rejected credentials, invalid scope, malformed responses
    Permanent,
}

/// Errors from the client-credentials exchange.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint unavailable ({status}): {body}")]
    Unavailable {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("invalid token client configuration: {0}")]
    Config(String),
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::Timeout(_) | AuthError::Http(_) | AuthError::Unavailable { .. } => {
                AuthErrorKind::Transient
            }
            AuthError::Rejected { .. } | AuthError::Malformed(_) | AuthError::Config(_) => {
                AuthErrorKind::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == AuthErrorKind::Transient
    }

    /// Server-provided minimum wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AuthError::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            AuthError::Timeout(_) => "timeout",
            AuthError::Http(_) => "http",
            AuthError::Unavailable { .. } => "unavailable",
            AuthError::Rejected { .. } => "rejected",
            AuthError::Malformed(_) => "malformed",
            AuthError::Config(_) => "config",
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
