//! Rotation state machine
//!
//! `handle_event` is pure: it receives the current status and an event and
//! returns the new status plus the action the engine loop must execute.

use std::time::Duration;

use pgtoken_auth::Token;
use serde::{Deserialize, Serialize};

/// Externally visible engine health.
///
/// Transitions:
/// - Starting → Healthy (first fetch + write succeeded)
/// - Starting → Failed (permanent auth failure, nothing was ever written)
/// - Healthy → Degraded (any failed rotation attempt)
/// - Degraded → Healthy (next successful rotation)
/// - any → Starting (restart)
/// - any → Failed (stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Starting,
    Healthy,
    Degraded,
    Failed,
}

impl EngineStatus {
    pub const ALL: [EngineStatus; 4] = [
        EngineStatus::Starting,
        EngineStatus::Healthy,
        EngineStatus::Degraded,
        EngineStatus::Failed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EngineStatus::Starting => "starting",
            EngineStatus::Healthy => "healthy",
            EngineStatus::Degraded => "degraded",
            EngineStatus::Failed => "failed",
        }
    }
}

/// Outcome of a rotation attempt or an operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationEvent {
    /// Token fetched (or re-used) and every artifact written
    Rotated,
    /// Retryable failure: network, 5xx, rate limit, or any write error
    TransientFailure,
    /// Credentials rejected or endpoint response unusable
    PermanentFailure,
    StopRequested,
    RestartRequested,
}

/// What the engine loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationAction {
    /// Sleep until the current token's refresh deadline
    ScheduleRefresh,
    /// Sleep for the back-off delay
    ScheduleRetry,
    /// Attempt a rotation without waiting
    RotateNow,
    /// Leave the loop
    Exit { exit_code: i32 },
}

/// Exit code when the very first fetch is rejected.
pub const EXIT_PERMANENT_FAILURE: i32 = 1;

/// Handle a state transition. Pure function: no I/O.
///
/// `artifact_promised` is true once this process has written an artifact;
/// from then on no auth failure may end the engine, since consumers would be
/// left without any credential.
pub fn handle_event(
    status: EngineStatus,
    event: RotationEvent,
    artifact_promised: bool,
) -> (EngineStatus, RotationAction) {
    use EngineStatus::*;
    use RotationEvent::*;

    match (status, event) {
        (_, StopRequested) => (Failed, RotationAction::Exit { exit_code: 0 }),

        // Terminal: a stopped or failed engine ignores everything else
        (Failed, _) => (Failed, RotationAction::Exit { exit_code: 0 }),

        (_, RestartRequested) => (Starting, RotationAction::RotateNow),

        (_, Rotated) => (Healthy, RotationAction::ScheduleRefresh),

        (Starting, PermanentFailure) if !artifact_promised => (
            Failed,
            RotationAction::Exit {
                exit_code: EXIT_PERMANENT_FAILURE,
            },
        ),
        (Starting, TransientFailure) if !artifact_promised => {
            (Starting, RotationAction::ScheduleRetry)
        }

        // After a healthy period the engine cannot tell "revoked" from
        // "temporarily broken", so both kinds keep it retrying.
        (Starting | Healthy | Degraded, TransientFailure | PermanentFailure) => {
            (Degraded, RotationAction::ScheduleRetry)
        }
    }
}

/// Mutable rotation state, owned by exactly one engine.
#[derive(Debug)]
pub struct RotationState {
    /// Last successfully fetched token
    pub current: Option<Token>,
    /// Token the artifacts on disk hold; lags `current` while writes fail
    pub served: Option<Token>,
    /// Whether the artifacts on disk reflect `current`
    pub last_write_ok: bool,
    pub consecutive_failures: u32,
    pub status: EngineStatus,
    /// Set once any artifact write by this process succeeded
    pub written_once: bool,
    pub last_success_ms: Option<u64>,
    pub last_error: Option<String>,
    pub next_attempt_at_ms: Option<u64>,
    /// Successful rotations since start
    pub rotations: u64,
}

impl Default for RotationState {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationState {
    pub fn new() -> Self {
        Self {
            current: None,
            served: None,
            last_write_ok: false,
            consecutive_failures: 0,
            status: EngineStatus::Starting,
            written_once: false,
            last_success_ms: None,
            last_error: None,
            next_attempt_at_ms: None,
            rotations: 0,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_success_ms: self.last_success_ms,
            expires_at_ms: self.served.as_ref().map(Token::expires_at_ms),
            next_attempt_at_ms: self.next_attempt_at_ms,
            last_error: self.last_error.clone(),
            artifact_written: self.last_write_ok,
            rotations: self.rotations,
        }
    }
}

/// Read-only view of the engine published after every state change.
///
/// Holds absolute timestamps only, so repeated queries without a rotation in
/// between return the same snapshot; durations are derived at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: EngineStatus,
    pub consecutive_failures: u32,
    pub last_success_ms: Option<u64>,
    pub expires_at_ms: Option<u64>,
    pub next_attempt_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub artifact_written: bool,
    pub rotations: u64,
}

impl StatusSnapshot {
    pub fn time_to_next_refresh(&self, now_ms: u64) -> Option<Duration> {
        self.next_attempt_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
    }

    /// Whether the token behind the artifact has passed its expiry.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    /// Whether consumers can currently rely on the artifact.
    pub fn is_serving(&self, now_ms: u64) -> bool {
        matches!(self.status, EngineStatus::Healthy | EngineStatus::Degraded)
            && self.expires_at_ms.is_some_and(|at| now_ms < at)
    }
}
