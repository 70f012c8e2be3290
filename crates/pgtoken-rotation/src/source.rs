//! Seams between the engine and its collaborators
//!
//! Uses `Pin<Box<dyn Future>>` return types so the engine can hold
//! `Arc<dyn TokenSource>` / `Arc<dyn ArtifactSink>` and tests can substitute
//! scripted fakes.

use std::future::Future;
use std::pin::Pin;

use pgtoken_artifact::CredentialWriter;
use pgtoken_auth::{Token, TokenClient};

/// Produces fresh tokens.
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = pgtoken_auth::Result<Token>> + Send + '_>>;
}

/// Persists tokens where consumers read them.
pub trait ArtifactSink: Send + Sync {
    fn write<'a>(
        &'a self,
        token: &'a Token,
    ) -> Pin<Box<dyn Future<Output = pgtoken_artifact::Result<()>> + Send + 'a>>;

    /// Delete the artifacts. Only used by the `remove` expired-artifact policy.
    fn remove(&self) -> Pin<Box<dyn Future<Output = pgtoken_artifact::Result<()>> + Send + '_>>;
}

impl TokenSource for TokenClient {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = pgtoken_auth::Result<Token>> + Send + '_>> {
        Box::pin(TokenClient::fetch(self))
    }
}

impl ArtifactSink for CredentialWriter {
    fn write<'a>(
        &'a self,
        token: &'a Token,
    ) -> Pin<Box<dyn Future<Output = pgtoken_artifact::Result<()>> + Send + 'a>> {
        Box::pin(CredentialWriter::write(self, token))
    }

    fn remove(&self) -> Pin<Box<dyn Future<Output = pgtoken_artifact::Result<()>> + Send + '_>> {
        Box::pin(CredentialWriter::remove(self))
    }
}
