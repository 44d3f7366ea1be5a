//! Local state record - the last idempotency key applied for each step.
//!
//! Written after a successful apply, cleared after a successful destroy or
//! rollback. The reconciler falls back to it when a step's query command
//! does not report a key of its own.

use chrono::{DateTime, Utc};
use keel_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateRecord {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub run_id: String,
}

pub struct StateStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, StateRecord>>,
}

impl StateStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, step: &str) -> Option<StateRecord> {
        self.lock().get(step).cloned()
    }

    pub fn steps(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub async fn record(&self, step: &str, record: StateRecord) -> Result<()> {
        let snapshot = {
            let mut records = self.lock();
            records.insert(step.to_string(), record);
            records.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn remove(&self, step: &str) -> Result<()> {
        let snapshot = {
            let mut records = self.lock();
            if records.remove(step).is_none() {
                return Ok(());
            }
            records.clone()
        };
        self.persist(&snapshot).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StateRecord>> {
        // A poisoned lock still holds consistent data: every mutation is a single insert/remove.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self, records: &BTreeMap<String, StateRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
