//! JWT expiry claim decoding
//!
//! Access tokens issued by OIDC-backed token endpoints are usually JWTs. The
//! `exp` claim is read without verifying the signature: the value is only used
//! to shorten our own idea of the token's lifetime, never to trust it more.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    exp: Option<serde_json::Value>,
}

/// Extract the `exp` claim (unix seconds) from a compact JWT.
///
/// Returns `None` for opaque tokens, undecodable payloads, or a missing or
/// non-numeric `exp`.
pub fn jwt_expiry(token: &str) -> Option<u64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;

    match claims.exp? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64)),
        _ => None,
    }
}
