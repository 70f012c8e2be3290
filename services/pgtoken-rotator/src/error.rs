//! Process-level failures and their exit codes

use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_AUTH: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_ALREADY_RUNNING: i32 = 3;
pub const EXIT_UNAVAILABLE: i32 = 4;

/// Failures that end the process with a specific exit code.
///
/// Anything else bubbling up as a plain `anyhow::Error` exits with
/// [`EXIT_UNAVAILABLE`].
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("credentials rejected: {0}")]
    Auth(#[from] pgtoken_auth::AuthError),

    #[error("another rotator already owns the admin address {0}")]
    AlreadyRunning(std::net::SocketAddr),

    #[error("rotator not reachable at {addr}: {reason}")]
    Unreachable {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("service manager command failed: {0}")]
    ServiceManager(String),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Auth(_) => EXIT_AUTH,
            Error::Config(_) => EXIT_CONFIG,
            Error::AlreadyRunning(_) => EXIT_ALREADY_RUNNING,
            Error::Unreachable { .. } | Error::Exhausted { .. } | Error::ServiceManager(_) => {
                EXIT_UNAVAILABLE
            }
        }
    }
}

/// Exit code for an error returned from a command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::exit_code)
        .or_else(|| {
            err.chain()
                .any(|cause| cause.is::<common::Error>())
                .then_some(EXIT_CONFIG)
        })
        .unwrap_or(EXIT_UNAVAILABLE)
}
