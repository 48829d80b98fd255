//! Client-local error log.
//!
//! Failures worth a user's attention are appended here with the call site
//! that recorded them. When a directory is configured the log is written to
//! `<dir>/errors.json` after every change and reloaded on startup, so it
//! survives restarts.

use std::panic::Location;
use std::path::Path;

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncResult;

const LOG_NAME: &str = "errors";

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Category, e.g. `barclamp` or `reconcile`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable summary.
    pub message: String,
    /// Backend payload or error detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// `file:line` of the code that recorded the entry.
    pub origin: String,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Bounded, optionally persisted list of [`ErrorRecord`]s.
#[derive(Debug)]
pub struct ErrorLog {
    store: Option<JsonStore>,
    entries: Mutex<Vec<ErrorRecord>>,
    max_entries: usize,
}

impl ErrorLog {
    /// A log that lives only in memory.
    #[must_use]
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            store: None,
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    /// A log persisted under `dir`, seeded with whatever was saved before.
    #[must_use]
    pub fn persistent(dir: &Path, max_entries: usize) -> Self {
        let store = JsonStore::new(dir, LOG_NAME);
        let mut entries: Vec<ErrorRecord> = store.load();
        trim(&mut entries, max_entries);
        Self {
            store: Some(store),
            entries: Mutex::new(entries),
            max_entries,
        }
    }

    /// Append an entry, dropping the oldest beyond the limit.
    ///
    /// A failure to persist is logged and does not lose the in-memory entry.
    #[track_caller]
    pub fn record(&self, kind: &str, message: impl Into<String>, detail: Option<Value>) {
        let caller = Location::caller();
        let record = ErrorRecord {
            kind: kind.to_string(),
            message: message.into(),
            detail,
            origin: format!("{}:{}", caller.file(), caller.line()),
            recorded_at: Utc::now(),
        };

        let snapshot = {
            let mut entries = self.entries.lock();
            entries.push(record);
            trim(&mut entries, self.max_entries);
            entries.clone()
        };

        if let Err(e) = self.save(&snapshot) {
            warn!(error = %e, "failed to persist error log");
        }
    }

    /// Recorded entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ErrorRecord> {
        self.entries.lock().clone()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry, including the persisted copy.
    pub fn clear(&self) -> SyncResult<()> {
        self.entries.lock().clear();
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(())
    }

    fn save(&self, entries: &[ErrorRecord]) -> SyncResult<()> {
        if let Some(store) = &self.store {
            store.save(entries)?;
        }
        Ok(())
    }
}

fn trim(entries: &mut Vec<ErrorRecord>, max: usize) {
    if entries.len() > max {
        let excess = entries.len() - max;
        entries.drain(..excess);
    }
}
