//! Token rotation engine
//!
//! Keeps a credential artifact continuously backed by an unexpired access
//! token. One loop owns all rotation state and alternates between waiting
//! (until the next deadline or a manual trigger) and rotating (fetch, then
//! write). Because there is only one loop, artifacts are always written in the
//! order tokens were fetched and no locking is needed.
//!
//! Lifecycle:
//! 1. `starting`: blocking first fetch + write; a permanent auth failure here
//!    ends the engine with exit code 1 and no artifact
//! 2. `healthy`: refresh at `expires_at - refresh_margin`
//! 3. `degraded`: a refresh failed; retry with capped exponential back-off,
//!    always attempting at least once before the current token expires
//! 4. `failed`: terminal, after a start-time permanent failure or a stop

pub mod clock;
pub mod engine;
pub mod metrics;
pub mod scheduler;
pub mod source;
pub mod state;

pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::{EngineHandle, ExpiredArtifactPolicy, OnceOutcome, RotationEngine, RunOutcome};
pub use scheduler::{MIN_RETRY_DELAY, RetryPolicy, Scheduler};
pub use source::{ArtifactSink, TokenSource};
pub use state::{
    EngineStatus, RotationAction, RotationEvent, RotationState, StatusSnapshot, handle_event,
};
