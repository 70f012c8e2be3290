//! Configuration types and loading
//!
//! Config path precedence: `--config` > `PGTOKEN_CONFIG` env var > default file.
//! The client secret is resolved from `PGTOKEN_CLIENT_SECRET`, then
//! `client_secret_file`, then the inline `client_secret`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use pgtoken_artifact::{ArtifactSpec, DatabaseTarget};
use pgtoken_auth::{ClientAuthMethod, TokenClientConfig};
use pgtoken_rotation::{ExpiredArtifactPolicy, RetryPolicy};
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_ENV: &str = "PGTOKEN_CONFIG";
pub const SECRET_ENV: &str = "PGTOKEN_CLIENT_SECRET";
pub const DEFAULT_CONFIG_FILE: &str = "pgtoken-rotator.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Token endpoint and service principal
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file holding the secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_retry_base")]
    pub retry_base_interval_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_interval_secs: u64,
    #[serde(default)]
    pub on_expiry: ExpiredArtifactPolicy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin(),
            retry_base_interval_secs: default_retry_base(),
            retry_max_interval_secs: default_retry_max(),
            on_expiry: ExpiredArtifactPolicy::default(),
        }
    }
}

/// Connection parameters rendered into the artifacts
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    /// Defaults to the client id, which is the role name of a service principal
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_clock_skew() -> u64 {
    30
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_retry_base() -> u64 {
    5
}

fn default_retry_max() -> u64 {
    120
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "databricks_postgres".into()
}

fn default_sslmode() -> String {
    "require".into()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9477))
}

fn default_max_connections() -> usize {
    16
}

impl Config {
    /// Load configuration from a TOML file, resolve the client secret, and
    /// validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| common::Error::io(path, e))?;
        let mut config: Config = toml::from_str(&contents)?;
        config.resolve_secret()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_secret(&mut self) -> common::Result<()> {
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            let secret = Secret::new(secret);
            if !secret.is_empty() {
                self.oauth.client_secret = Some(secret);
                return Ok(());
            }
        }
        if let Some(ref file) = self.oauth.client_secret_file {
            let secret = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                self.oauth.client_secret = Some(Secret::new(secret));
            }
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        let oauth = &self.oauth;
        if !oauth.token_endpoint.starts_with("http://")
            && !oauth.token_endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "token_endpoint must start with http:// or https://, got: {}",
                oauth.token_endpoint
            )));
        }
        if oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }
        if oauth.client_secret.as_ref().is_none_or(Secret::is_empty) {
            return Err(common::Error::Config(format!(
                "no client secret: set {SECRET_ENV}, client_secret_file or client_secret"
            )));
        }
        if oauth.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        let rotation = &self.rotation;
        if rotation.refresh_margin_secs == 0 {
            return Err(common::Error::Config(
                "refresh_margin_secs must be greater than 0".into(),
            ));
        }
        if rotation.retry_base_interval_secs == 0 {
            return Err(common::Error::Config(
                "retry_base_interval_secs must be greater than 0".into(),
            ));
        }
        if rotation.retry_max_interval_secs < rotation.retry_base_interval_secs {
            return Err(common::Error::Config(format!(
                "retry_max_interval_secs ({}) must not be below retry_base_interval_secs ({})",
                rotation.retry_max_interval_secs, rotation.retry_base_interval_secs
            )));
        }
        if rotation.retry_max_interval_secs >= rotation.refresh_margin_secs {
            warn!(
                retry_max_interval_secs = rotation.retry_max_interval_secs,
                refresh_margin_secs = rotation.refresh_margin_secs,
                "retry back-off can exceed the refresh margin; retries will be pulled forward before expiry"
            );
        }

        if self.database.host.trim().is_empty() {
            return Err(common::Error::Config("database.host must not be empty".into()));
        }
        if self.artifacts.is_empty() {
            return Err(common::Error::Config(
                "at least one [[artifacts]] entry is required".into(),
            ));
        }
        for artifact in &self.artifacts {
            if artifact.path.file_name().is_none() {
                return Err(common::Error::Config(format!(
                    "artifact path has no file name: {}",
                    artifact.path.display()
                )));
            }
        }
        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or `PGTOKEN_CONFIG`.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    pub fn token_client_config(&self) -> TokenClientConfig {
        TokenClientConfig {
            token_endpoint: self.oauth.token_endpoint.clone(),
            client_id: self.oauth.client_id.clone(),
            client_secret: self
                .oauth
                .client_secret
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
            scope: self.oauth.scope.clone(),
            auth_method: self.oauth.auth_method,
            request_timeout: Duration::from_secs(self.oauth.request_timeout_secs),
            clock_skew: Duration::from_secs(self.oauth.clock_skew_secs),
            refresh_margin: Duration::from_secs(self.rotation.refresh_margin_secs),
        }
    }

    pub fn database_target(&self) -> DatabaseTarget {
        DatabaseTarget {
            host: self.database.host.clone(),
            port: self.database.port,
            dbname: self.database.dbname.clone(),
            user: self
                .database
                .user
                .clone()
                .unwrap_or_else(|| self.oauth.client_id.clone()),
            sslmode: self.database.sslmode.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.rotation.retry_base_interval_secs),
            max: Duration::from_secs(self.rotation.retry_max_interval_secs),
        }
    }
}
