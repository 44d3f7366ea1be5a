//! Credential context - short-lived authentication material for one run.
//!
//! Acquired once before the run, shared read-only (behind `Arc`) by the
//! reconciler and the executor, invalidated when the run ends.

use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct CredentialContext {
    values: BTreeMap<String, String>,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    invalidated: AtomicBool,
}

impl CredentialContext {
    pub fn new(values: BTreeMap<String, String>, ttl: Option<Duration>) -> Self {
        let acquired_at = Utc::now();
        Self {
            values,
            acquired_at,
            expires_at: ttl.map(|ttl| acquired_at + ttl),
            invalidated: AtomicBool::new(false),
        }
    }

    /// A context carrying no material. Useful for local-only step sets.
    pub fn empty() -> Self {
        Self::new(BTreeMap::new(), None)
    }

    /// Capture environment variables and run the optional credential command.
    pub async fn acquire(
        config: &CredentialConfig,
        shell_program: &str,
        working_dir: &Path,
    ) -> Result<Self> {
        let mut values = BTreeMap::new();

        for name in &config.required_env {
            let value = std::env::var(name).map_err(|_| {
                Error::CredentialsUnavailable(format!("required variable {} is not set", name))
            })?;
            values.insert(name.clone(), value);
        }
        for name in &config.optional_env {
            if let Ok(value) = std::env::var(name) {
                values.insert(name.clone(), value);
            }
        }

        if let Some(command) = &config.command {
            let output = tokio::process::Command::new(shell_program)
                .arg("-c")
                .arg(command)
                .current_dir(working_dir)
                .output()
                .await
                .map_err(|e| Error::CredentialsUnavailable(format!("failed to run: {}", e)))?;
            if !output.status.success() {
                return Err(Error::CredentialsUnavailable(format!(
                    "credential command exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let extra: BTreeMap<String, String> = serde_json::from_slice(&output.stdout)
                .map_err(|e| {
                    Error::CredentialsUnavailable(format!(
                        "credential command must print a JSON object of strings: {}",
                        e
                    ))
                })?;
            values.extend(extra);
        }

        let ttl = (config.ttl_secs > 0).then(|| Duration::seconds(config.ttl_secs as i64));
        let ctx = Self::new(values, ttl);
        tracing::info!(names = ?ctx.names(), expires_at = ?ctx.expires_at, "credentials acquired");
        Ok(ctx)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    /// Name/value pairs to hand to external commands. Empty once invalid.
    pub fn env_pairs(&self) -> Vec<(&str, &str)> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        if self.invalidated.load(Ordering::Acquire) {
            return false;
        }
        match self.expires_at {
            Some(at) => Utc::now() < at,
            None => true,
        }
    }

    /// Mark the context unusable. Called when the run ends.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialContext")
            .field("names", &self.names())
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .field("valid", &self.is_valid())
            .finish()
    }
}
