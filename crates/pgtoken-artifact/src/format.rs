//! Artifact renderers
//!
//! Each renderer produces the complete file content for one artifact. The
//! pgpass renderer also takes the current file content so that entries for
//! other databases survive a rotation.

use serde::{Deserialize, Serialize};

/// Output formats understood by PostgreSQL tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// libpq keyword/value connection string
    Conninfo,
    /// `~/.pgpass` password file
    Pgpass,
    /// `PGHOST=...` style environment file
    Env,
}

impl ArtifactFormat {
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactFormat::Conninfo => "conninfo",
            ArtifactFormat::Pgpass => "pgpass",
            ArtifactFormat::Env => "env",
        }
    }
}

/// The database the token authenticates against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub sslmode: String,
}

/// Render the full artifact content.
///
/// `existing` is the current file content and is only consulted for
/// [`ArtifactFormat::Pgpass`].
pub fn render(
    format: ArtifactFormat,
    target: &DatabaseTarget,
    password: &str,
    existing: Option<&str>,
) -> String {
    match format {
        ArtifactFormat::Conninfo => render_conninfo(target, password),
        ArtifactFormat::Pgpass => merge_pgpass(existing.unwrap_or_default(), target, password),
        ArtifactFormat::Env => render_env(target, password),
    }
}

fn render_conninfo(target: &DatabaseTarget, password: &str) -> String {
    let port = target.port.to_string();
    let pairs = [
        ("host", target.host.as_str()),
        ("port", port.as_str()),
        ("dbname", target.dbname.as_str()),
        ("user", target.user.as_str()),
        ("password", password),
        ("sslmode", target.sslmode.as_str()),
    ];
    let mut out = pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", conninfo_value(v)))
        .collect::<Vec<_>>()
        .join(" ");
    out.push('\n');
    out
}

/// libpq quoting: empty values and values with whitespace, `'` or `\` are
/// single-quoted with backslash escapes.
fn conninfo_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

fn pgpass_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace(':', "\\:")
}

fn pgpass_prefix(target: &DatabaseTarget) -> String {
    format!(
        "{}:{}:{}:{}:",
        pgpass_field(&target.host),
        target.port,
        pgpass_field(&target.dbname),
        pgpass_field(&target.user)
    )
}

/// Replace (or append) the entry for `target`, keeping every other line.
fn merge_pgpass(existing: &str, target: &DatabaseTarget, password: &str) -> String {
    let prefix = pgpass_prefix(target);
    let mut out = String::with_capacity(existing.len() + prefix.len() + password.len() + 1);
    for line in existing.lines() {
        if line.starts_with(&prefix) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&prefix);
    out.push_str(&pgpass_field(password));
    out.push('\n');
    out
}

fn render_env(target: &DatabaseTarget, password: &str) -> String {
    let port = target.port.to_string();
    let vars = [
        ("PGHOST", target.host.as_str()),
        ("PGPORT", port.as_str()),
        ("PGDATABASE", target.dbname.as_str()),
        ("PGUSER", target.user.as_str()),
        ("PGPASSWORD", password),
        ("PGSSLMODE", target.sslmode.as_str()),
    ];
    vars.iter()
        .map(|(k, v)| format!("{k}={}\n", env_value(v)))
        .collect()
}

/// Shell-style single quoting for anything outside a conservative charset.
fn env_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:@+=".contains(c));
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
