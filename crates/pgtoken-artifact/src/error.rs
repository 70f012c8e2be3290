//! Error types for artifact writes

use std::path::PathBuf;

/// Failure to render or persist a credential artifact.
///
/// The rotation engine treats every variant as transient: the in-memory token
/// is kept and the write is retried with back-off.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact path has no file name: {0}")]
    InvalidPath(PathBuf),
}

impl WriteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for artifact operations.
pub type Result<T> = std::result::Result<T, WriteError>;
