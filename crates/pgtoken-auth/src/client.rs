//! Client-credentials exchange against an OAuth token endpoint
//!
//! One POST per call, no internal retries: retry policy belongs to the
//! rotation scheduler, which needs to see every failure to drive back-off and
//! status reporting.

use std::time::Duration;

use common::Secret;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;

use crate::claims::jwt_expiry;
use crate::error::{AuthError, Result};
use crate::token::{Token, unix_now_ms};

/// Scope requested when the configuration does not name one.
pub const DEFAULT_SCOPE: &str = "all-apis";

/// Longest endpoint error body carried into an error message.
const MAX_ERROR_BODY: usize = 512;

/// How the client authenticates itself to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMethod {
    /// `client_secret_basic`: HTTP Basic authorization header
    #[default]
    Basic,
    /// `client_secret_post`: credentials in the form body
    Post,
}

/// Everything needed to perform the exchange.
#[derive(Debug, Clone)]
pub struct TokenClientConfig {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub scope: Option<String>,
    pub auth_method: ClientAuthMethod,
    pub request_timeout: Duration,
    /// Subtracted from every computed expiry.
    pub clock_skew: Duration,
    /// Copied into each `Token` so the scheduler can compute its deadline.
    pub refresh_margin: Duration,
}

/// Raw token endpoint response. Every field is optional so that validation
/// produces a `Malformed` error naming the problem instead of a serde error.
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until expiry. Some providers send it as a string.
    #[serde(default)]
    pub expires_in: Option<serde_json::Value>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Validate the response and resolve the token's lifetime.
    ///
    /// When both `expires_in` and a JWT `exp` claim are present the earlier
    /// expiry wins. `clock_skew` is then subtracted from the result.
    pub fn into_token(
        self,
        received_at_ms: u64,
        clock_skew: Duration,
        refresh_margin: Duration,
    ) -> Result<Token> {
        let access_token = match self.access_token {
            Some(t) if !t.trim().is_empty() => Secret::new(t),
            _ => return Err(AuthError::Malformed("response has no access_token".into())),
        };

        if let Some(token_type) = &self.token_type
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            return Err(AuthError::Malformed(format!(
                "unsupported token_type {token_type:?}"
            )));
        }

        let from_expires_in = match &self.expires_in {
            Some(value) => {
                let secs = parse_expires_in(value)?;
                Some(received_at_ms.saturating_add(secs.saturating_mul(1000)))
            }
            None => None,
        };
        let from_claim = jwt_expiry(access_token.expose()).map(|exp| exp.saturating_mul(1000));

        let raw_expiry = match (from_expires_in, from_claim) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => {
                return Err(AuthError::Malformed(
                    "response carries neither expires_in nor an exp claim".into(),
                ));
            }
        };

        let expires_at_ms = raw_expiry.saturating_sub(clock_skew.as_millis() as u64);
        Token::new(access_token, received_at_ms, expires_at_ms, refresh_margin)
    }
}

fn parse_expires_in(value: &serde_json::Value) -> Result<u64> {
    let secs = match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match secs {
        Some(0) => Err(AuthError::Malformed("expires_in must be positive".into())),
        Some(secs) => Ok(secs),
        None => Err(AuthError::Malformed(format!(
            "expires_in is not a positive integer: {value}"
        ))),
    }
}

/// Map a non-success HTTP status to an error.
///
/// 5xx, 408 and 429 are transient; every other status is a permanent
/// rejection (bad credentials, unknown client, invalid scope).
pub fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> AuthError {
    let body = truncate(body);
    if status >= 500 || status == 429 || status == 408 {
        AuthError::Unavailable {
            status,
            body,
            retry_after,
        }
    } else {
        AuthError::Rejected { status, body }
    }
}

/// Delta-seconds `Retry-After`. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: String) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        return body;
    }
    let mut cut: String = body.chars().take(MAX_ERROR_BODY).collect();
    cut.push_str("...");
    cut
}

/// Performs the client-credentials grant.
pub struct TokenClient {
    http: reqwest::Client,
    config: TokenClientConfig,
}

impl TokenClient {
    /// Build a client whose requests are bounded by `config.request_timeout`.
    pub fn new(config: TokenClientConfig) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            return Err(AuthError::Config("client_id is empty".into()));
        }
        if config.client_secret.is_empty() {
            return Err(AuthError::Config("client_secret is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Request a fresh token.
    pub async fn fetch(&self) -> Result<Token> {
        let scope = self.config.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        let mut form: Vec<(&str, &str)> =
            vec![("grant_type", "client_credentials"), ("scope", scope)];

        let mut request = self.http.post(&self.config.token_endpoint);
        match self.config.auth_method {
            ClientAuthMethod::Basic => {
                request = request.basic_auth(
                    &self.config.client_id,
                    Some(self.config.client_secret.expose()),
                );
            }
            ClientAuthMethod::Post => {
                form.push(("client_id", self.config.client_id.as_str()));
                form.push(("client_secret", self.config.client_secret.expose().as_str()));
            }
        }

        debug!(endpoint = %self.config.token_endpoint, scope, "requesting token");

        let response = request.form(&form).send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout(self.config.request_timeout)
            } else {
                AuthError::Http(format!("token request failed: {e}"))
            }
        })?;
        let received_at_ms = unix_now_ms();

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(classify_status(status.as_u16(), body, retry_after));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout(self.config.request_timeout)
            } else {
                AuthError::Http(format!("reading token response: {e}"))
            }
        })?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| AuthError::Malformed(format!("invalid token response JSON: {e}")))?;

        parsed.into_token(
            received_at_ms,
            self.config.clock_skew,
            self.config.refresh_margin,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Form;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use std::collections::HashMap;

    const RECEIVED: u64 = 1_760_000_000_000;

    fn config(endpoint: &str, auth_method: ClientAuthMethod) -> TokenClientConfig {
        TokenClientConfig {
            token_endpoint: endpoint.to_string(),
            client_id: "sp-client".into(),
            client_secret: Secret::from("sp-secret"),
            scope: None,
            auth_method,
            request_timeout: Duration::from_secs(5),
            clock_skew: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(300),
        }
    }

    /// Start an in-process token endpoint and return its URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/oidc/v1/token")
    }

    fn jwt_with_exp(exp: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn into_token_uses_expires_in_minus_skew() {
        let response = TokenResponse {
            access_token: Some("opaque-token".into()),
            token_type: Some("Bearer".into()),
            expires_in: Some(serde_json::json!(3600)),
            scope: None,
        };
        let token = response
            .into_token(RECEIVED, Duration::from_secs(30), Duration::from_secs(300))
            .unwrap();
        assert_eq!(token.issued_at_ms(), RECEIVED);
        assert_eq!(token.expires_at_ms(), RECEIVED + 3_570_000);
        assert_eq!(token.access_token(), "opaque-token");
    }

    #[test]
    fn into_token_accepts_string_expires_in() {
        let response = TokenResponse {
            access_token: Some("t".into()),
            expires_in: Some(serde_json::json!("600")),
            ..Default::default()
        };
        let token = response
            .into_token(RECEIVED, Duration::ZERO, Duration::from_secs(60))
            .unwrap();
        assert_eq!(token.expires_at_ms(), RECEIVED + 600_000);
    }

    #[test]
    fn into_token_prefers_earlier_jwt_exp() {
        let exp = RECEIVED / 1000 + 900;
        let response = TokenResponse {
            access_token: Some(jwt_with_exp(exp)),
            expires_in: Some(serde_json::json!(3600)),
            ..Default::default()
        };
        let token = response
            .into_token(RECEIVED, Duration::ZERO, Duration::from_secs(60))
            .unwrap();
        assert_eq!(token.expires_at_ms(), exp * 1000);
    }

    #[test]
    fn into_token_uses_claim_when_expires_in_missing() {
        let exp = RECEIVED / 1000 + 1200;
        let response = TokenResponse {
            access_token: Some(jwt_with_exp(exp)),
            ..Default::default()
        };
        let token = response
            .into_token(RECEIVED, Duration::ZERO, Duration::from_secs(60))
            .unwrap();
        assert_eq!(token.expires_at_ms(), exp * 1000);
    }

    #[test]
    fn into_token_without_lifetime_is_malformed() {
        let response = TokenResponse {
            access_token: Some("opaque".into()),
            ..Default::default()
        };
        let err = response
            .into_token(RECEIVED, Duration::ZERO, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn into_token_rejects_zero_and_garbage_expires_in() {
        for value in [serde_json::json!(0), serde_json::json!(-5), serde_json::json!("soon")] {
            let response = TokenResponse {
                access_token: Some("t".into()),
                expires_in: Some(value.clone()),
                ..Default::default()
            };
            let err = response
                .into_token(RECEIVED, Duration::ZERO, Duration::ZERO)
                .unwrap_err();
            assert!(matches!(err, AuthError::Malformed(_)), "value {value}");
        }
    }

    #[test]
    fn into_token_rejects_lifetime_swallowed_by_skew() {
        let response = TokenResponse {
            access_token: Some("t".into()),
            expires_in: Some(serde_json::json!(20)),
            ..Default::default()
        };
        let err = response
            .into_token(RECEIVED, Duration::from_secs(30), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn into_token_rejects_non_bearer_type() {
        let response = TokenResponse {
            access_token: Some("t".into()),
            token_type: Some("mac".into()),
            expires_in: Some(serde_json::json!(60)),
            ..Default::default()
        };
        assert!(matches!(
            response.into_token(RECEIVED, Duration::ZERO, Duration::ZERO),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn classify_status_table() {
        assert!(classify_status(500, String::new(), None).is_transient());
        assert!(classify_status(503, String::new(), None).is_transient());
        assert!(classify_status(429, String::new(), None).is_transient());
        assert!(classify_status(408, String::new(), None).is_transient());
        assert!(!classify_status(400, String::new(), None).is_transient());
        assert!(!classify_status(401, String::new(), None).is_transient());
        assert!(!classify_status(403, String::new(), None).is_transient());
    }

    #[test]
    fn classify_status_truncates_long_bodies() {
        let err = classify_status(502, "x".repeat(5000), None);
        match err {
            AuthError::Unavailable { body, .. } => assert_eq!(body.len(), MAX_ERROR_BODY + 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn new_rejects_empty_credentials() {
        let mut cfg = config("http://127.0.0.1:1/token", ClientAuthMethod::Basic);
        cfg.client_secret = Secret::from(" ");
        assert!(matches!(TokenClient::new(cfg), Err(AuthError::Config(_))));
    }

    #[tokio::test]
    async fn fetch_with_basic_auth() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(
                |headers: AxumHeaders, Form(form): Form<HashMap<String, String>>| async move {
                    let expected = format!("Basic {}", STANDARD.encode("sp-client:sp-secret"));
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    if auth != expected
                        || form.get("grant_type").map(String::as_str) != Some("client_credentials")
                        || form.get("scope").map(String::as_str) != Some(DEFAULT_SCOPE)
                        || form.contains_key("client_secret")
                    {
                        return (StatusCode::UNAUTHORIZED, "invalid_client").into_response();
                    }
                    axum::Json(serde_json::json!({
                        "access_token": "at-basic",
                        "token_type": "Bearer",
                        "expires_in": 3600,
                    }))
                    .into_response()
                },
            ),
        );
        let url = serve(router).await;

        let client = TokenClient::new(config(&url, ClientAuthMethod::Basic)).unwrap();
        let before = unix_now_ms();
        let token = client.fetch().await.unwrap();
        let after = unix_now_ms();

        assert_eq!(token.access_token(), "at-basic");
        assert!(token.issued_at_ms() >= before && token.issued_at_ms() <= after);
        assert_eq!(
            token.expires_at_ms() - token.issued_at_ms(),
            3_600_000 - 30_000
        );
        assert_eq!(token.refresh_margin(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn fetch_with_post_auth_sends_credentials_in_body() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(
                |headers: AxumHeaders, Form(form): Form<HashMap<String, String>>| async move {
                    if headers.contains_key("authorization")
                        || form.get("client_id").map(String::as_str) != Some("sp-client")
                        || form.get("client_secret").map(String::as_str) != Some("sp-secret")
                        || form.get("scope").map(String::as_str) != Some("sql")
                    {
                        return (StatusCode::BAD_REQUEST, "invalid_request").into_response();
                    }
                    axum::Json(serde_json::json!({
                        "access_token": "at-post",
                        "expires_in": "1800",
                    }))
                    .into_response()
                },
            ),
        );
        let url = serve(router).await;

        let mut cfg = config(&url, ClientAuthMethod::Post);
        cfg.scope = Some("sql".into());
        let token = TokenClient::new(cfg).unwrap().fetch().await.unwrap();
        assert_eq!(token.access_token(), "at-post");
    }

    #[tokio::test]
    async fn fetch_401_is_permanent() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(|| async { (StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#) }),
        );
        let url = serve(router).await;

        let err = TokenClient::new(config(&url, ClientAuthMethod::Basic))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(
            matches!(err, AuthError::Rejected { status: 401, ref body } if body.contains("invalid_client"))
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn fetch_429_is_transient_with_retry_after() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "7")],
                    "slow down",
                )
            }),
        );
        let url = serve(router).await;

        let err = TokenClient::new(config(&url, ClientAuthMethod::Basic))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn fetch_503_is_transient() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let url = serve(router).await;

        let err = TokenClient::new(config(&url, ClientAuthMethod::Basic))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable { status: 503, .. }));
    }

    #[tokio::test]
    async fn fetch_non_json_success_is_malformed() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(|| async { "<html>login</html>" }),
        );
        let url = serve(router).await;

        let err = TokenClient::new(config(&url, ClientAuthMethod::Basic))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[tokio::test]
    async fn fetch_timeout_is_transient() {
        let router = Router::new().route(
            "/oidc/v1/token",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "late"
            }),
        );
        let url = serve(router).await;

        let mut cfg = config(&url, ClientAuthMethod::Basic);
        cfg.request_timeout = Duration::from_millis(50);
        let err = TokenClient::new(cfg).unwrap().fetch().await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)), "got: {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fetch_connection_refused_is_transient() {
        let err = TokenClient::new(config("http://127.0.0.1:1/token", ClientAuthMethod::Basic))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Http(_)), "got: {err:?}");
        assert!(err.is_transient());
    }
}
