//! In-process store with JSON snapshots.
//!
//! Holds the work tree as a parent → children map plus free-form records.
//! In live mode the content exists only between `start` and `stop`, and a
//! dump is the only way it survives a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::store::{SnapshotRef, StoreConnection, StoreService, StoreStats, UnitStore};
use crate::errors::{CheckpointError, PipelineResult};
use crate::units::{UnitId, WorkUnit};

/// Serialized form of the store, used for seeds and dumps alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreContent {
    #[serde(default)]
    pub children: BTreeMap<UnitId, Vec<WorkUnit>>,
    #[serde(default)]
    pub records: BTreeMap<String, String>,
}

impl StoreContent {
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let content = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| CheckpointError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn with_children(mut self, parent: UnitId, children: Vec<WorkUnit>) -> Self {
        self.children.insert(parent, children);
        self
    }

    pub fn stats(&self) -> StoreStats {
        let units = self.children.values().flatten();
        StoreStats {
            parents: self.children.len(),
            units: self.children.values().map(Vec::len).sum(),
            total_size: units.clone().map(|u| u.size).sum(),
            max_unit_size: units.map(|u| u.size).max().unwrap_or(0),
            records: self.records.len(),
        }
    }
}

pub struct MemoryStore {
    descriptor: StoreConnection,
    live: bool,
    snapshot_dir: PathBuf,
    seed: StoreContent,
    /// `None` while a live store is stopped.
    state: Mutex<Option<StoreContent>>,
}

impl MemoryStore {
    pub fn new(
        descriptor: impl Into<String>,
        live: bool,
        snapshot_dir: impl Into<PathBuf>,
        seed: StoreContent,
    ) -> Self {
        let state = if live { None } else { Some(seed.clone()) };
        Self {
            descriptor: StoreConnection::new(descriptor),
            live,
            snapshot_dir: snapshot_dir.into(),
            seed,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<StoreContent>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_live(&self) -> CheckpointError {
        CheckpointError::NotLive {
            descriptor: self.descriptor.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn put_record(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.lock();
        let content = guard.as_mut().ok_or_else(|| self.not_live())?;
        content.records.insert(key.into(), value.into());
        Ok(())
    }

    /// A copy of the current content, if running.
    pub fn content(&self) -> Option<StoreContent> {
        self.lock().clone()
    }
}

#[async_trait]
impl StoreService for MemoryStore {
    fn requires_live_service(&self) -> bool {
        self.live
    }

    fn descriptor(&self) -> StoreConnection {
        self.descriptor.clone()
    }

    async fn start(&self, restore: Option<&SnapshotRef>) -> Result<StoreConnection, CheckpointError> {
        let content = match restore {
            Some(snapshot) => StoreContent::load(snapshot.path())?,
            None => self.seed.clone(),
        };
        debug!(store = %self.descriptor, restored = restore.is_some(), "memory store started");
        *self.lock() = Some(content);
        Ok(self.descriptor.clone())
    }

    async fn request_dump(&self, label: &str) -> Result<SnapshotRef, CheckpointError> {
        let content = self.content().ok_or_else(|| self.not_live())?;
        let path = self.snapshot_dir.join(format!("{}.json", label));
        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(io_err)?;
        let json = serde_json::to_string_pretty(&content).map_err(|e| CheckpointError::Snapshot {
            path: path.clone(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&path, json).await.map_err(io_err)?;
        Ok(SnapshotRef::new(path))
    }

    async fn stop(&self) -> Result<(), CheckpointError> {
        if self.live {
            *self.lock() = None;
        }
        Ok(())
    }

    async fn stats(&self) -> Option<StoreStats> {
        self.lock().as_ref().map(StoreContent::stats)
    }
}

#[async_trait]
impl UnitStore for MemoryStore {
    async fn child_units(
        &self,
        _store: Option<&StoreConnection>,
        parents: &[WorkUnit],
    ) -> PipelineResult<Vec<WorkUnit>> {
        let guard = self.lock();
        let content = guard.as_ref().ok_or_else(|| self.not_live())?;
        Ok(parents
            .iter()
            .filter_map(|p| content.children.get(&p.id))
            .flatten()
            .copied()
            .collect())
    }
}
