//! Append-only log of completed checkpoints.
//!
//! One line per event: `label|status|snapshot|rfc3339`. A durable store
//! that writes no snapshot is logged with `-` in the snapshot column.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::CheckpointRecord;
use crate::services::SnapshotRef;

pub const STATUS_COMPLETED: &str = "completed";

const NO_SNAPSHOT: &str = "-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub label: String,
    pub status: String,
    pub snapshot: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }

    /// The checkpoint this entry describes.
    pub fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            label: self.label.clone(),
            snapshot: self.snapshot.clone().map(SnapshotRef::new),
            created_at: self.timestamp,
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        let [label, status, snapshot, timestamp] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            label: label.to_string(),
            status: status.to_string(),
            snapshot: (*snapshot != NO_SNAPSHOT).then(|| PathBuf::from(snapshot)),
            timestamp: DateTime::parse_from_rfc3339(timestamp)
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

pub struct CheckpointLedger {
    path: PathBuf,
}

impl CheckpointLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &CheckpointRecord, status: &str) -> Result<()> {
        let snapshot = record
            .snapshot
            .as_ref()
            .map(|s| s.path().display().to_string())
            .unwrap_or_else(|| NO_SNAPSHOT.to_string());
        let entry = format!(
            "{}|{}|{}|{}\n",
            record.label,
            status,
            snapshot,
            record.created_at.to_rfc3339()
        );

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open checkpoint ledger")?
            .write_all(entry.as_bytes())
            .context("Failed to write ledger entry")?;

        Ok(())
    }

    /// All parsable entries, oldest first. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read checkpoint ledger")?;
        Ok(content.lines().filter_map(LedgerEntry::parse).collect())
    }

    pub fn last_completed(&self) -> Result<Option<LedgerEntry>> {
        Ok(self.entries()?.into_iter().rfind(LedgerEntry::is_completed))
    }

    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove checkpoint ledger")?;
        }
        Ok(())
    }
}
