//! Checkpoint boundaries around a live primary store.
//!
//! - `manager`: start/restore, run a phase group, dump, stop, wait, archive
//! - `ledger`: the `label|status|snapshot|timestamp` log used to resume

pub mod ledger;
pub mod manager;

pub use ledger::{CheckpointLedger, LedgerEntry, STATUS_COMPLETED};
pub use manager::{CheckpointManager, DumpPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::services::SnapshotRef;

/// A durable snapshot tagged with the phase group it follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub label: String,
    /// `None` when the store is durable and nothing was dumped.
    pub snapshot: Option<SnapshotRef>,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(label: impl Into<String>, snapshot: Option<SnapshotRef>) -> Self {
        Self {
            label: label.into(),
            snapshot,
            created_at: Utc::now(),
        }
    }
}

/// Where the context of checkpoint `label` is saved.
pub fn context_path(snapshot_dir: &Path, label: &str) -> PathBuf {
    snapshot_dir.join(format!("{}.context.json", label))
}
