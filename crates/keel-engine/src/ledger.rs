//! Run ledger - append-only record of every step attempt in one run.
//!
//! The executor is the only writer. Each entry reaches the sink before the
//! executor acts on it, so an `attempting` entry with no successor marks an
//! action that was in flight when the process died.

use chrono::{DateTime, Utc};
use keel_core::{ActionKind, Result, StepId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Attempting,
    Succeeded,
    Skipped,
    TransientFailure,
    PermanentFailure,
    ReconcileUnavailable,
    DriftDetected,
    Cancelled,
    CredentialsExpired,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl Outcome {
    /// Entries that open an action and expect a closing entry.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Attempting | Self::RollingBack)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientFailure
                | Self::PermanentFailure
                | Self::ReconcileUnavailable
                | Self::DriftDetected
                | Self::CredentialsExpired
                | Self::RollbackFailed
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Attempting => "attempting",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::ReconcileUnavailable => "reconcile_unavailable",
            Self::DriftDetected => "drift_detected",
            Self::Cancelled => "cancelled",
            Self::CredentialsExpired => "credentials_expired",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerEntry {
    pub seq: u64,
    pub run_id: String,
    pub step: StepId,
    pub action: ActionKind,
    pub attempt: u32,
    pub outcome: Outcome,
    pub ts: DateTime<Utc>,
    pub message: String,
}

impl LedgerEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{:>4} {} {:<12} {:<8} #{} {:<22} {}",
            self.seq,
            self.ts.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.step,
            self.action,
            self.attempt,
            self.outcome,
            self.message,
        )
    }
}

/// Where ledger entries are made durable.
#[async_trait::async_trait]
pub trait LedgerSink: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// Physical location, for humans.
    fn location(&self) -> String;
}

/// Keeps entries in memory only.
pub struct NullSink;

#[async_trait::async_trait]
impl LedgerSink for NullSink {
    async fn append(&self, _entry: &LedgerEntry) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> String {
        "(memory)".into()
    }
}

/// One JSON object per line, synced to disk on every append.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<dir>/<run_id>.jsonl`
    pub fn for_run(dir: impl AsRef<Path>, run_id: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{}.jsonl", run_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl LedgerSink for JsonlSink {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct RunLedger {
    run_id: String,
    entries: Vec<LedgerEntry>,
    sink: Arc<dyn LedgerSink>,
}

impl RunLedger {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn LedgerSink>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
            sink,
        }
    }

    pub fn in_memory(run_id: impl Into<String>) -> Self {
        Self::new(run_id, Arc::new(NullSink))
    }

    /// Generate a run id: UTC timestamp plus a short random suffix.
    pub fn new_run_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
    }

    /// Append an entry. It is durable in the sink before this returns.
    pub async fn record(
        &mut self,
        step: &StepId,
        action: ActionKind,
        attempt: u32,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Result<()> {
        let entry = LedgerEntry {
            seq: self.entries.len() as u64 + 1,
            run_id: self.run_id.clone(),
            step: step.clone(),
            action,
            attempt,
            outcome,
            ts: Utc::now(),
            message: message.into(),
        };
        self.sink.append(&entry).await?;
        tracing::debug!(
            run_id = %self.run_id,
            step = %entry.step,
            attempt,
            outcome = %outcome,
            "ledger entry"
        );
        self.entries.push(entry);
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn location(&self) -> String {
        self.sink.location()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn for_step<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries.iter().filter(move |e| e.step.as_str() == step)
    }

    /// Read a ledger file written by [`JsonlSink`].
    pub fn load(path: &Path) -> Result<Vec<LedgerEntry>> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }

    /// Most recent `*.jsonl` ledger in `dir`, if any. Run ids sort by time.
    pub fn latest_in(dir: &Path) -> Option<PathBuf> {
        let mut ledgers: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|x| x == "jsonl").unwrap_or(false))
            .collect();
        ledgers.sort();
        ledgers.pop()
    }
}

/// Open entries never closed by a later entry for the same step, action and
/// attempt: actions that may have been interrupted mid-flight.
pub fn dangling_attempts(entries: &[LedgerEntry]) -> Vec<&LedgerEntry> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.outcome.is_open())
        .filter(|(i, e)| {
            !entries[i + 1..].iter().any(|later| {
                later.step == e.step
                    && later.action == e.action
                    && later.attempt == e.attempt
                    && !later.outcome.is_open()
            })
        })
        .map(|(_, e)| e)
        .collect()
}
