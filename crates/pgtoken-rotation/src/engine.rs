//! The rotation loop
//!
//! [`RotationEngine::run`] is the only place that mutates rotation state. It
//! alternates between rotating (fetch, then write) and waiting. The wait ends
//! at the scheduled deadline, on a manual trigger, or on stop. Rotation itself
//! is never cancelled: a stop that arrives mid-flight is honoured once the
//! attempt has finished and its result has been written.

use std::sync::Arc;
use std::time::Duration;

use pgtoken_artifact::WriteError;
use pgtoken_auth::{AuthError, Token};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::metrics;
use crate::scheduler::Scheduler;
use crate::source::{ArtifactSink, TokenSource};
use crate::state::{
    EngineStatus, RotationAction, RotationEvent, RotationState, StatusSnapshot, handle_event,
};

/// Control channel depth. Extra triggers beyond this are coalesced anyway.
const COMMAND_BUFFER: usize = 8;

/// Longest single sleep. Waits are re-evaluated against the wall clock at
/// least this often, so a suspended host does not oversleep a deadline.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// What to do with the artifacts once the token behind them has expired and
/// no replacement could be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiredArtifactPolicy {
    /// Leave the expired credential in place
    #[default]
    Keep,
    /// Delete the artifacts so consumers fail fast
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    RotateNow,
    Restart,
}

/// How [`RotationEngine::run`] ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Stopped on request
    Stopped,
    /// The first fetch was rejected and nothing was ever written
    Failed(AuthError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Stopped => 0,
            RunOutcome::Failed(_) => crate::state::EXIT_PERMANENT_FAILURE,
        }
    }
}

/// Result of [`RotationEngine::rotate_once`].
#[derive(Debug)]
pub enum OnceOutcome {
    Written { expires_at_ms: u64 },
    Failed(AuthError),
    Exhausted { attempts: u32, last_error: String },
}

/// Cloneable remote control for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    stop: Arc<watch::Sender<bool>>,
    status: watch::Receiver<StatusSnapshot>,
}

impl EngineHandle {
    /// Ask for an immediate rotation. Returns false if the engine has exited.
    ///
    /// A trigger sent while a rotation is in flight is satisfied by that
    /// rotation and does not cause a second one.
    pub fn rotate_now(&self) -> bool {
        self.send(Command::RotateNow)
    }

    /// Re-enter `starting` and rotate immediately. Returns false if the engine
    /// has exited.
    pub fn restart(&self) -> bool {
        self.send(Command::Restart)
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Latest published snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?command, "control channel full, trigger coalesced");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Auth(AuthError),
    Write(WriteError),
}

impl AttemptError {
    fn event(&self) -> RotationEvent {
        match self {
            AttemptError::Auth(e) if !e.is_transient() => RotationEvent::PermanentFailure,
            _ => RotationEvent::TransientFailure,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::Auth(e) => e.retry_after(),
            AttemptError::Write(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self.event() {
            RotationEvent::PermanentFailure => "permanent_failure",
            _ => "transient_failure",
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Auth(e) => write!(f, "{e}"),
            AttemptError::Write(e) => write!(f, "{e}"),
        }
    }
}

enum Wake {
    Deadline,
    Stop,
    Command(Command),
}

/// Keeps the artifacts backed by an unexpired token.
pub struct RotationEngine {
    source: Arc<dyn TokenSource>,
    sink: Arc<dyn ArtifactSink>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    expired_policy: ExpiredArtifactPolicy,
    state: RotationState,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<StatusSnapshot>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl RotationEngine {
    pub fn new(
        source: Arc<dyn TokenSource>,
        sink: Arc<dyn ArtifactSink>,
        scheduler: Scheduler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = RotationState::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(state.snapshot());
        Self {
            source,
            sink,
            scheduler,
            clock,
            expired_policy: ExpiredArtifactPolicy::default(),
            state,
            commands_tx,
            commands_rx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            status_tx,
            status_rx,
        }
    }

    pub fn with_expired_policy(mut self, policy: ExpiredArtifactPolicy) -> Self {
        self.expired_policy = policy;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.commands_tx.clone(),
            stop: Arc::clone(&self.stop_tx),
            status: self.status_rx.clone(),
        }
    }

    /// Run until stopped, or until the first fetch is permanently rejected.
    pub async fn run(mut self) -> RunOutcome {
        let mut force_fetch = false;

        loop {
            let result = self.attempt(force_fetch).await;
            force_fetch = false;
            let now = self.clock.now_ms();

            let (event, retry_after) = match &result {
                Ok(()) => (RotationEvent::Rotated, None),
                Err(e) => (e.event(), e.retry_after()),
            };
            let action = self.apply(event);

            let delay = match action {
                RotationAction::Exit { exit_code } => {
                    self.state.next_attempt_at_ms = None;
                    self.publish(now);
                    error!(exit_code, "credentials rejected before any artifact was written");
                    return match result {
                        Err(AttemptError::Auth(e)) => RunOutcome::Failed(e),
                        _ => RunOutcome::Stopped,
                    };
                }
                RotationAction::ScheduleRefresh => match &self.state.current {
                    Some(token) => self.scheduler.after_success(token, now),
                    None => Duration::ZERO,
                },
                RotationAction::ScheduleRetry => self.scheduler.after_failure(
                    self.state.served.as_ref(),
                    self.state.consecutive_failures,
                    retry_after,
                    now,
                ),
                RotationAction::RotateNow => Duration::ZERO,
            };
            let deadline = deadline_after(now, delay);
            self.state.next_attempt_at_ms = Some(deadline);

            if result.is_err() {
                self.check_expired(now).await;
            }
            self.publish(now);
            debug!(
                status = self.state.status.label(),
                next_attempt_in_secs = delay.as_secs(),
                "next rotation scheduled"
            );

            if *self.stop_rx.borrow() {
                return self.stopped();
            }

            // Triggers queued while rotating were satisfied by that rotation
            let mut restart = false;
            while let Ok(command) = self.commands_rx.try_recv() {
                match command {
                    Command::RotateNow => debug!("manual trigger coalesced into completed rotation"),
                    Command::Restart => restart = true,
                }
            }
            if restart {
                self.restart();
                force_fetch = true;
                continue;
            }

            match self.wait_until(deadline).await {
                Wake::Deadline => {}
                Wake::Stop => return self.stopped(),
                Wake::Command(Command::RotateNow) => {
                    info!("manual rotation requested");
                    force_fetch = true;
                }
                Wake::Command(Command::Restart) => {
                    self.restart();
                    force_fetch = true;
                }
            }
        }
    }

    /// Fetch and write once, retrying transient failures up to `attempts`
    /// times with the usual back-off. Used for one-shot invocations.
    pub async fn rotate_once(mut self, attempts: u32) -> OnceOutcome {
        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.attempt(false).await {
                Ok(()) => {
                    let now = self.clock.now_ms();
                    self.apply(RotationEvent::Rotated);
                    self.publish(now);
                    let expires_at_ms = self
                        .state
                        .current
                        .as_ref()
                        .map(Token::expires_at_ms)
                        .unwrap_or_default();
                    return OnceOutcome::Written { expires_at_ms };
                }
                Err(AttemptError::Auth(e)) if !e.is_transient() => {
                    self.apply(RotationEvent::PermanentFailure);
                    return OnceOutcome::Failed(e);
                }
                Err(e) => {
                    let retry_after = e.retry_after();
                    last_error = e.to_string();
                    self.apply(RotationEvent::TransientFailure);
                    if attempt < attempts {
                        let now = self.clock.now_ms();
                        let delay = self.scheduler.after_failure(
                            self.state.served.as_ref(),
                            self.state.consecutive_failures,
                            retry_after,
                            now,
                        );
                        warn!(
                            attempt,
                            attempts,
                            retry_in_secs = delay.as_secs(),
                            "rotation attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        OnceOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    /// One fetch + write. Re-uses the in-memory token when only the previous
    /// write failed and the token is not yet due for refresh.
    async fn attempt(&mut self, force_fetch: bool) -> Result<(), AttemptError> {
        let now = self.clock.now_ms();
        let rewrite = !force_fetch
            && !self.state.last_write_ok
            && self
                .state
                .current
                .as_ref()
                .is_some_and(|t| now < t.refresh_at_ms());

        let reused = if rewrite {
            self.state.current.clone()
        } else {
            None
        };
        let token = match reused {
            Some(token) => {
                debug!("rewriting current token after failed write");
                token
            }
            None => match self.source.fetch().await {
                Ok(token) => {
                    self.state.current = Some(token.clone());
                    self.state.last_write_ok = false;
                    token
                }
                Err(e) => return Err(self.failed(AttemptError::Auth(e))),
            },
        };

        if let Err(e) = self.sink.write(&token).await {
            return Err(self.failed(AttemptError::Write(e)));
        }

        let now = self.clock.now_ms();
        self.state.served = Some(token.clone());
        self.state.last_write_ok = true;
        self.state.written_once = true;
        self.state.consecutive_failures = 0;
        self.state.last_success_ms = Some(now);
        self.state.last_error = None;
        self.state.rotations += 1;
        metrics::record_attempt("success");
        info!(
            expires_in_secs = token.remaining(now).as_secs(),
            rotations = self.state.rotations,
            "token rotated"
        );
        Ok(())
    }

    fn failed(&mut self, e: AttemptError) -> AttemptError {
        self.state.consecutive_failures += 1;
        self.state.last_error = Some(e.to_string());
        metrics::record_attempt(e.label());
        warn!(
            error = %e,
            consecutive_failures = self.state.consecutive_failures,
            "rotation attempt failed"
        );
        e
    }

    /// Feed `event` through the state machine, logging any status change.
    fn apply(&mut self, event: RotationEvent) -> RotationAction {
        let from = self.state.status;
        let (to, action) = handle_event(from, event, self.state.written_once);
        if from != to {
            info!(from = from.label(), to = to.label(), ?event, "engine status changed");
        }
        self.state.status = to;
        action
    }

    fn restart(&mut self) {
        info!("restart requested");
        self.apply(RotationEvent::RestartRequested);
        self.state.consecutive_failures = 0;
    }

    fn stopped(mut self) -> RunOutcome {
        self.apply(RotationEvent::StopRequested);
        self.state.next_attempt_at_ms = None;
        self.publish(self.clock.now_ms());
        info!("rotation engine stopped");
        RunOutcome::Stopped
    }

    /// Warn while an expired token backs the artifacts, and apply the policy.
    async fn check_expired(&mut self, now: u64) {
        let Some(token) = &self.state.served else {
            return;
        };
        if !token.is_expired(now) {
            return;
        }
        warn!(
            expired_for_secs = (now - token.expires_at_ms()) / 1000,
            "artifacts hold an expired token"
        );

        if self.expired_policy == ExpiredArtifactPolicy::Remove {
            match self.sink.remove().await {
                Ok(()) => {
                    error!("removed artifacts holding an expired token");
                    self.state.served = None;
                    self.state.last_write_ok = false;
                }
                Err(e) => error!(error = %e, "failed to remove expired artifacts"),
            }
        }
    }

    fn publish(&self, now: u64) {
        let snapshot = self.state.snapshot();
        metrics::record_snapshot(&snapshot, now);
        self.status_tx.send_replace(snapshot);
    }

    async fn wait_until(&mut self, deadline_ms: u64) -> Wake {
        loop {
            let now = self.clock.now_ms();
            if now >= deadline_ms {
                return Wake::Deadline;
            }
            let slice = Duration::from_millis(deadline_ms - now).min(MAX_SLEEP_SLICE);

            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow_and_update() {
                        return Wake::Stop;
                    }
                }
                command = self.commands_rx.recv() => {
                    return match command {
                        Some(command) => Wake::Command(command),
                        None => Wake::Stop,
                    };
                }
            }
        }
    }
}

/// Unix-millisecond deadline `delay` after `now`, saturating instead of
/// wrapping for absurd delays.
fn deadline_after(now_ms: u64, delay: Duration) -> u64 {
    now_ms.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
}
