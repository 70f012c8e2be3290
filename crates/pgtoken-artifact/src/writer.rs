//! Atomic artifact writes
//!
//! Every write goes to a temporary file in the target's directory, is synced,
//! and is then renamed over the target. Rename within one directory is atomic
//! on POSIX filesystems, so readers never observe a truncated artifact. The
//! temporary file is created with mode 0600 so the token is never readable by
//! other users, not even before the rename.

use std::path::{Path, PathBuf};

use pgtoken_auth::Token;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Result, WriteError};
use crate::format::{ArtifactFormat, DatabaseTarget, render};

/// One output file and its format.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArtifactSpec {
    pub path: PathBuf,
    pub format: ArtifactFormat,
}

/// Writes a token into every configured artifact.
pub struct CredentialWriter {
    target: DatabaseTarget,
    artifacts: Vec<ArtifactSpec>,
}

impl CredentialWriter {
    pub fn new(target: DatabaseTarget, artifacts: Vec<ArtifactSpec>) -> Self {
        Self { target, artifacts }
    }

    pub fn artifacts(&self) -> &[ArtifactSpec] {
        &self.artifacts
    }

    /// Render and atomically replace every artifact.
    ///
    /// All artifacts are attempted even if one fails; the first failure is
    /// returned.
    pub async fn write(&self, token: &Token) -> Result<()> {
        let mut first_error = None;
        for spec in &self.artifacts {
            if let Err(e) = self.write_one(spec, token).await {
                warn!(
                    path = %spec.path.display(),
                    format = spec.format.label(),
                    error = %e,
                    "failed to write credential artifact"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write_one(&self, spec: &ArtifactSpec, token: &Token) -> Result<()> {
        let existing = match spec.format {
            ArtifactFormat::Pgpass => read_existing(&spec.path).await?,
            _ => None,
        };
        let contents = render(
            spec.format,
            &self.target,
            token.access_token(),
            existing.as_deref(),
        );
        write_atomic(&spec.path, contents.as_bytes()).await
    }

    /// Delete every artifact. Missing files are not an error.
    pub async fn remove(&self) -> Result<()> {
        for spec in &self.artifacts {
            match tokio::fs::remove_file(&spec.path).await {
                Ok(()) => debug!(path = %spec.path.display(), "removed credential artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(WriteError::io(&spec.path, e)),
            }
        }
        Ok(())
    }
}

async fn read_existing(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WriteError::io(path, e)),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Path of the temporary file used while replacing `path`.
pub(crate) fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| WriteError::InvalidPath(path.to_path_buf()))?;
    Ok(parent_dir(path).join(format!(
        ".{}.tmp.{}",
        name.to_string_lossy(),
        std::process::id()
    )))
}

/// Replace `path` with `contents` atomically (temp file + fsync + rename).
///
/// Creates the parent directory if needed. On any failure the temporary file
/// is removed and the previous artifact is left untouched.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = temp_path(path)?;
    let dir = parent_dir(path);

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| WriteError::io(dir, e))?;

    if let Err(e) = write_synced(&tmp_path, contents).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(WriteError::io(path, e));
    }

    // Persist the rename itself. Not every platform lets a directory be
    // opened for sync, so failure here is only logged.
    match tokio::fs::File::open(dir).await {
        Ok(d) => {
            if let Err(e) = d.sync_all().await {
                debug!(dir = %dir.display(), error = %e, "directory sync failed");
            }
        }
        Err(e) => debug!(dir = %dir.display(), error = %e, "directory open for sync failed"),
    }

    debug!(path = %path.display(), bytes = contents.len(), "replaced credential artifact");
    Ok(())
}

async fn write_synced(tmp_path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(tmp_path)
        .await
        .map_err(|e| WriteError::io(tmp_path, e))?;

    // A stale temp file from a crashed run keeps its old mode; reset it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| WriteError::io(tmp_path, e))?;
    }

    file.write_all(contents)
        .await
        .map_err(|e| WriteError::io(tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| WriteError::io(tmp_path, e))?;
    Ok(())
}
