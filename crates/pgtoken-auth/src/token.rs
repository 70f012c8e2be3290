//! Access token value type
//!
//! All timestamps are unix milliseconds. `expires_at_ms` is the locally
//! computed expiry with clock skew already subtracted, so it is safe to treat
//! as the instant after which the token must no longer be handed out.

use std::time::Duration;

use common::Secret;

use crate::error::{AuthError, Result};

/// Current wall-clock time as unix milliseconds.
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A validated access token with a known lifetime.
///
/// Constructed only through [`Token::new`], which refuses a token whose expiry
/// is not after its issue time.
#[derive(Debug, Clone)]
pub struct Token {
    access_token: Secret<String>,
    issued_at_ms: u64,
    expires_at_ms: u64,
    refresh_margin: Duration,
}

impl Token {
    pub fn new(
        access_token: Secret<String>,
        issued_at_ms: u64,
        expires_at_ms: u64,
        refresh_margin: Duration,
    ) -> Result<Self> {
        if access_token.is_empty() {
            return Err(AuthError::Malformed("access_token is empty".into()));
        }
        if expires_at_ms <= issued_at_ms {
            return Err(AuthError::Malformed(format!(
                "token expires at {expires_at_ms} which is not after its issue time {issued_at_ms}"
            )));
        }
        Ok(Self {
            access_token,
            issued_at_ms,
            expires_at_ms,
            refresh_margin,
        })
    }

    /// The bearer value. Never log this.
    pub fn access_token(&self) -> &str {
        self.access_token.expose()
    }

    pub fn issued_at_ms(&self) -> u64 {
        self.issued_at_ms
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Instant at which a refresh should be attempted.
    ///
    /// A margin that does not fit inside the lifetime is clamped to half the
    /// lifetime, otherwise every fetch would immediately be due again.
    pub fn refresh_at_ms(&self) -> u64 {
        let lifetime_ms = self.expires_at_ms - self.issued_at_ms;
        let margin_ms = self.refresh_margin.as_millis() as u64;
        let margin_ms = if margin_ms >= lifetime_ms {
            lifetime_ms / 2
        } else {
            margin_ms
        };
        self.expires_at_ms - margin_ms
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Lifetime left at `now_ms` (zero once expired).
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUED: u64 = 1_760_000_000_000;

    fn token(lifetime_secs: u64, margin_secs: u64) -> Token {
        Token::new(
            Secret::from("eyJ.test.token"),
            ISSUED,
            ISSUED + lifetime_secs * 1000,
            Duration::from_secs(margin_secs),
        )
        .unwrap()
    }

    #[test]
    fn refresh_at_is_expiry_minus_margin() {
        let t = token(3600, 300);
        assert_eq!(t.refresh_at_ms(), ISSUED + 3_300_000);
        assert_eq!(t.expires_at_ms() - t.issued_at_ms(), 3_600_000);
    }

    #[test]
    fn margin_larger_than_lifetime_is_clamped_to_half() {
        let t = token(60, 300);
        assert_eq!(t.refresh_at_ms(), ISSUED + 30_000);
    }

    #[test]
    fn rejects_expiry_not_after_issue() {
        let err = Token::new(Secret::from("t"), ISSUED, ISSUED, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));

        let err = Token::new(Secret::from("t"), ISSUED, ISSUED - 1, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn rejects_empty_access_token() {
        let err = Token::new(Secret::from(""), ISSUED, ISSUED + 1000, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn expiry_checks() {
        let t = token(10, 1);
        assert!(!t.is_expired(ISSUED + 9_999));
        assert!(t.is_expired(ISSUED + 10_000));
        assert_eq!(t.remaining(ISSUED + 4_000), Duration::from_secs(6));
        assert_eq!(t.remaining(ISSUED + 20_000), Duration::ZERO);
    }

    #[test]
    fn debug_does_not_leak_token() {
        let t = token(10, 1);
        let debug = format!("{t:?}");
        assert!(!debug.contains("eyJ.test.token"), "got: {debug}");
    }
}
