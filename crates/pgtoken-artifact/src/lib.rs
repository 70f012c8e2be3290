//! Credential artifacts consumed by PostgreSQL client tooling
//!
//! Renders an access token into a libpq connection string, a `.pgpass` line,
//! or a `PG*` environment file, and replaces the artifact on disk atomically
//! so a concurrent reader sees either the previous or the new complete file.
//!
//! Consumers must re-open the artifact for every new connection; a descriptor
//! held across a rotation keeps pointing at the replaced file.

pub mod error;
pub mod format;
pub mod writer;

pub use error::{Result, WriteError};
pub use format::{ArtifactFormat, DatabaseTarget, render};
pub use writer::{ArtifactSpec, CredentialWriter, write_atomic};
