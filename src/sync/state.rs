//! Durable per-(entity, backend) sync memory.
//!
//! One JSON file per record under `.roadmap/sync/<backend>/records/`, plus
//! a per-backend listing cursor. Every write goes through the atomic writer;
//! any failure is a `StateWrite` error, which callers treat as fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::EntityKind;
use crate::error::{Result, RoadmapError};
use crate::storage::AtomicWriter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub entity_id: String,
    pub backend: String,
    pub remote_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_kind: Option<EntityKind>,
    /// Local fingerprint at the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pushed_fingerprint: Option<String>,
    /// Remote fingerprint (mapped back to local fields) at the last
    /// successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pulled_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conflict_marker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncRecord {
    pub fn new(
        entity_id: impl Into<String>,
        backend: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            backend: backend.into(),
            remote_id: remote_id.into(),
            entity_kind: None,
            last_pushed_fingerprint: None,
            last_pulled_fingerprint: None,
            last_synced_at: None,
            conflict_marker: false,
            last_error: None,
        }
    }

    /// Record a successful sync with both baselines.
    pub fn mark_synced(&mut self, local_fp: String, remote_fp: String, at: DateTime<Utc>) {
        self.last_pushed_fingerprint = Some(local_fp);
        self.last_pulled_fingerprint = Some(remote_fp);
        self.last_synced_at = Some(at);
        self.conflict_marker = false;
        self.last_error = None;
    }

    #[must_use]
    pub const fn has_baseline(&self) -> bool {
        self.last_pushed_fingerprint.is_some() && self.last_pulled_fingerprint.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cursor {
    listed_at: DateTime<Utc>,
}

pub struct SyncStateTracker {
    root: PathBuf,
    writer: AtomicWriter,
}

impl SyncStateTracker {
    pub const DIR: &'static str = "sync";

    /// Tracker rooted at `<data_dir>/sync`.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        let root = data_dir.join(Self::DIR);
        Self {
            writer: AtomicWriter::without_backups(&root),
            root,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, entity_id: &str, backend: &str) -> Result<Option<SyncRecord>> {
        let path = self.record_path(entity_id, backend);
        if !path.is_file() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// All records for `backend`, keyed by entity id. An unreadable record
    /// is an error: silently dropping one could duplicate a remote entity.
    pub fn records(&self, backend: &str) -> Result<BTreeMap<String, SyncRecord>> {
        let dir = self.records_dir(backend);
        let mut out = BTreeMap::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let record = read_record(&path)?;
            out.insert(record.entity_id.clone(), record);
        }
        Ok(out)
    }

    /// Atomically persist one record.
    pub fn commit(&self, record: &SyncRecord) -> Result<()> {
        let path = self.record_path(&record.entity_id, &record.backend);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| RoadmapError::StateWrite(format!("serialize record: {e}")))?;
        self.writer
            .write_atomic(&path, &json)
            .map_err(|e| RoadmapError::StateWrite(e.to_string()))?;
        debug!(
            entity_id = %record.entity_id,
            backend = %record.backend,
            remote_id = %record.remote_id,
            "Committed sync record"
        );
        Ok(())
    }

    /// Remove the record for this pair. Returns whether one existed.
    pub fn unlink(&self, entity_id: &str, backend: &str) -> Result<bool> {
        let path = self.record_path(entity_id, backend);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RoadmapError::StateWrite(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn cursor(&self, backend: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.cursor_path(backend);
        if !path.is_file() {
            return Ok(None);
        }
        let cursor: Cursor = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(Some(cursor.listed_at))
    }

    pub fn set_cursor(&self, backend: &str, listed_at: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(&Cursor { listed_at })?;
        self.writer
            .write_atomic(&self.cursor_path(backend), &json)
            .map_err(|e| RoadmapError::StateWrite(e.to_string()))
    }

    fn records_dir(&self, backend: &str) -> PathBuf {
        self.root.join(backend).join("records")
    }

    fn record_path(&self, entity_id: &str, backend: &str) -> PathBuf {
        self.records_dir(backend).join(format!("{entity_id}.json"))
    }

    fn cursor_path(&self, backend: &str) -> PathBuf {
        self.root.join(backend).join("cursor.json")
    }
}

fn read_record(path: &Path) -> Result<SyncRecord> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        RoadmapError::LocalCorruption(format!("sync record {}: {e}", path.display()))
    })
}
