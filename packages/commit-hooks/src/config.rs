use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

pub const FLUSH_BEFORE_COMMIT_VAR: &str = "COMMIT_HOOKS_FLUSH_BEFORE_COMMIT";
pub const SCOPED_QUERIES_VAR: &str = "COMMIT_HOOKS_SCOPED_QUERIES";

/// Commit lifecycle configuration.
///
/// Both switches default to on. Turning them off is meant for engines that
/// already flush inside `commit()` or that keep their transaction usable
/// after it concludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Flush pending changes before dispatching before-commit hooks.
    pub flush_before_commit: bool,
    /// Run after/failed hooks against a scratch transaction.
    pub scoped_queries: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            flush_before_commit: true,
            scoped_queries: true,
        }
    }
}

impl HooksConfig {
    pub fn with_flush_before_commit(mut self, enabled: bool) -> Self {
        self.flush_before_commit = enabled;
        self
    }

    pub fn with_scoped_queries(mut self, enabled: bool) -> Self {
        self.scoped_queries = enabled;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            flush_before_commit: flag_from_env(
                FLUSH_BEFORE_COMMIT_VAR,
                defaults.flush_before_commit,
            )?,
            scoped_queries: flag_from_env(SCOPED_QUERIES_VAR, defaults.scoped_queries)?,
        })
    }
}

fn flag_from_env(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => parse_flag(&raw).with_context(|| format!("{name} must be a boolean")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("unrecognized flag value {other:?}"),
    }
}
