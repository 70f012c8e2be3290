//! Local admin API
//!
//! Bound to a loopback address by default. The listener doubles as the
//! single-instance guard: a second `run` fails to bind and exits with code 3.
//!
//! Endpoints:
//! - GET  /health  : 200 while the artifact holds an unexpired token, else 503
//! - GET  /status  : engine snapshot plus time to next refresh
//! - POST /rotate  : rotate now (202)
//! - POST /restart : re-enter `starting` and rotate now (202)
//! - GET  /metrics : Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use pgtoken_rotation::{Clock, EngineHandle, StatusSnapshot};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Error;

/// Timeout for CLI requests against a running rotator.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    engine: EngineHandle,
    clock: Arc<dyn Clock>,
    prometheus: PrometheusHandle,
}

impl AdminState {
    pub fn new(engine: EngineHandle, clock: Arc<dyn Clock>, prometheus: PrometheusHandle) -> Self {
        Self {
            engine,
            clock,
            prometheus,
        }
    }
}

/// `/status` body: the snapshot plus values derived at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub expired: bool,
    pub time_to_next_refresh_secs: Option<u64>,
}

impl StatusReport {
    pub fn new(snapshot: StatusSnapshot, now_ms: u64) -> Self {
        Self {
            expired: snapshot.is_expired(now_ms),
            time_to_next_refresh_secs: snapshot
                .time_to_next_refresh(now_ms)
                .map(|d| d.as_secs()),
            snapshot,
        }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/rotate", post(rotate))
        .route("/restart", post(restart))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Bind the admin listener, reporting an occupied address as a running
/// instance.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, anyhow::Error> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(Error::AlreadyRunning(addr).into())
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("failed to bind admin listener on {addr}"))),
    }
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /health
async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.engine.status();
    let now = state.clock.now_ms();
    let code = if snapshot.is_serving(now) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json(
        code,
        serde_json::json!({
            "status": snapshot.status,
            "expired": snapshot.is_expired(now),
            "consecutive_failures": snapshot.consecutive_failures,
        }),
    )
}

/// GET /status
async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let report = StatusReport::new(state.engine.status(), state.clock.now_ms());
    match serde_json::to_value(&report) {
        Ok(body) => json(StatusCode::OK, body),
        Err(e) => json(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// POST /rotate
async fn rotate(State(state): State<AdminState>) -> impl IntoResponse {
    accepted(state.engine.rotate_now(), "rotate")
}

/// POST /restart
async fn restart(State(state): State<AdminState>) -> impl IntoResponse {
    accepted(state.engine.restart(), "restart")
}

fn accepted(sent: bool, operation: &'static str) -> impl IntoResponse {
    if sent {
        info!(operation, "admin request accepted");
        json(StatusCode::ACCEPTED, serde_json::json!({ "accepted": operation }))
    } else {
        json(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": "rotation engine has stopped" }),
        )
    }
}

/// GET /metrics
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// CLI side of the admin API.
pub struct AdminClient {
    http: reqwest::Client,
    addr: SocketAddr,
}

impl AdminClient {
    pub fn new(addr: SocketAddr) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()?;
        Ok(Self { http, addr })
    }

    pub async fn status(&self) -> Result<StatusReport, Error> {
        let response = self
            .http
            .get(self.url("/status"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !response.status().is_success() {
            return Err(
                self.unreachable(format!("status endpoint returned {}", response.status()))
            );
        }
        response.json().await.map_err(|e| self.unreachable(e))
    }

    pub async fn rotate(&self) -> Result<(), Error> {
        self.post("/rotate").await
    }

    pub async fn restart(&self) -> Result<(), Error> {
        self.post("/restart").await
    }

    async fn post(&self, path: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(self.url(path))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if response.status() != reqwest::StatusCode::ACCEPTED {
            return Err(self.unreachable(format!("{path} returned {}", response.status())));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> Error {
        Error::Unreachable {
            addr: self.addr,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::Secret;
    use pgtoken_artifact::{ArtifactFormat, ArtifactSpec, CredentialWriter, DatabaseTarget};
    use pgtoken_auth::{ClientAuthMethod, TokenClient, TokenClientConfig};
    use pgtoken_rotation::{EngineStatus, RetryPolicy, RotationEngine, Scheduler, SystemClock};
    use tower::ServiceExt;

    /// Start a fake token endpoint issuing one-hour tokens.
    async fn start_token_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/oidc/v1/token",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({
                    "access_token": "dapi-test-token",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/oidc/v1/token")
    }

    fn test_engine(endpoint: String, dir: &std::path::Path) -> RotationEngine {
        let client = TokenClient::new(TokenClientConfig {
            token_endpoint: endpoint,
            client_id: "sp".into(),
            client_secret: Secret::from("secret"),
            scope: None,
            auth_method: ClientAuthMethod::Basic,
            request_timeout: Duration::from_secs(5),
            clock_skew: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(300),
        })
        .unwrap();
        let writer = CredentialWriter::new(
            DatabaseTarget {
                host: "db.example.com".into(),
                port: 5432,
                dbname: "databricks_postgres".into(),
                user: "sp".into(),
                sslmode: "require".into(),
            },
            vec![ArtifactSpec {
                path: dir.join("conninfo"),
                format: ArtifactFormat::Conninfo,
            }],
        );
        RotationEngine::new(
            Arc::new(client),
            Arc::new(writer),
            Scheduler::new(RetryPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(10),
            }),
            Arc::new(SystemClock),
        )
    }

    fn test_state(engine: &RotationEngine) -> AdminState {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        AdminState::new(engine.handle(), Arc::new(SystemClock), recorder.handle())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn wait_for_status(handle: &EngineHandle, want: EngineStatus) {
        let mut updates = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            updates.wait_for(|s| s.status == want),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn health_is_unavailable_while_starting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine("http://127.0.0.1:1/token".into(), dir.path());
        let app = build_admin_router(test_state(&engine), 4);

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "starting");
    }

    #[tokio::test]
    async fn health_and_status_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = start_token_server().await;
        let engine = test_engine(endpoint, dir.path());
        let state = test_state(&engine);
        let handle = engine.handle();
        tokio::spawn(engine.run());
        wait_for_status(&handle, EngineStatus::Healthy).await;

        let app = build_admin_router(state, 4);
        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["expired"], false);

        let (status, body) = get_json(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let report: StatusReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.snapshot.status, EngineStatus::Healthy);
        assert!(report.snapshot.artifact_written);
        assert!(!report.expired);
        // 3600s lifetime - 30s skew - 300s margin
        let next = report.time_to_next_refresh_secs.unwrap();
        assert!(next > 3200 && next <= 3270, "next refresh in {next}s");

        let written = std::fs::read_to_string(dir.path().join("conninfo")).unwrap();
        assert!(written.contains("password=dapi-test-token"));
        handle.stop();
    }

    #[tokio::test]
    async fn rotate_and_restart_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine("http://127.0.0.1:1/token".into(), dir.path());
        let app = build_admin_router(test_state(&engine), 4);

        for uri in ["/rotate", "/restart"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED, "{uri}");
        }
    }

    #[tokio::test]
    async fn rotate_after_engine_exit_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine("http://127.0.0.1:1/token".into(), dir.path());
        let app = build_admin_router(test_state(&engine), 4);
        drop(engine);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rotate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine("http://127.0.0.1:1/token".into(), dir.path());
        let app = build_admin_router(test_state(&engine), 4);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn client_talks_to_running_admin_api() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = start_token_server().await;
        let engine = test_engine(endpoint, dir.path());
        let state = test_state(&engine);
        let handle = engine.handle();
        tokio::spawn(engine.run());
        wait_for_status(&handle, EngineStatus::Healthy).await;

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_admin_router(state, 4);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AdminClient::new(addr).unwrap();
        let report = client.status().await.unwrap();
        assert_eq!(report.snapshot.status, EngineStatus::Healthy);
        client.rotate().await.unwrap();
        client.restart().await.unwrap();
        handle.stop();
    }

    #[tokio::test]
    async fn client_reports_unreachable_rotator() {
        let client = AdminClient::new("127.0.0.1:1".parse().unwrap()).unwrap();
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn second_bind_reports_already_running() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert_eq!(
            crate::error::exit_code_for(&err),
            crate::error::EXIT_ALREADY_RUNNING
        );
    }
}
