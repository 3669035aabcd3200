use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ledger::{CheckpointLedger, STATUS_COMPLETED};
use super::{CheckpointRecord, context_path};
use crate::config::StoreSection;
use crate::context::PipelineContext;
use crate::dispatch::Dispatcher;
use crate::errors::{CheckpointError, PipelineResult};
use crate::jobs::{JobKind, StoreServiceJob};
use crate::services::{ArchiveSink, SnapshotRef, StoreService, suffix};

/// How long to wait for a requested dump to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpPolicy {
    pub poll_interval: Duration,
    /// `None` polls until the file appears.
    pub max_attempts: Option<u32>,
}

impl DumpPolicy {
    pub fn from_section(section: &StoreSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.dump_poll_interval_ms),
            max_attempts: section.max_dump_polls,
        }
    }
}

/// Brackets phase groups with the lifecycle of the primary store.
///
/// Only one group holds a live store at a time: a boundary starts only after
/// the previous one has dumped and stopped.
pub struct CheckpointManager {
    service: Arc<dyn StoreService>,
    dispatcher: Arc<Dispatcher>,
    archive: Option<Arc<dyn ArchiveSink>>,
    ledger: CheckpointLedger,
    snapshot_dir: PathBuf,
    policy: DumpPolicy,
    live: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(
        service: Arc<dyn StoreService>,
        dispatcher: Arc<Dispatcher>,
        ledger: CheckpointLedger,
        snapshot_dir: impl Into<PathBuf>,
        policy: DumpPolicy,
    ) -> Self {
        Self {
            service,
            dispatcher,
            archive: None,
            ledger,
            snapshot_dir: snapshot_dir.into(),
            policy,
            live: Mutex::new(()),
        }
    }

    pub fn with_archive(mut self, archive: Option<Arc<dyn ArchiveSink>>) -> Self {
        self.archive = archive;
        self
    }

    pub fn ledger(&self) -> &CheckpointLedger {
        &self.ledger
    }

    /// Run `body` against a live primary store and checkpoint the result.
    ///
    /// The store is restored from `restore` when given. On success the store
    /// has been dumped and stopped, the ledger records the checkpoint, and the
    /// returned context no longer carries a primary connection.
    pub async fn run_checkpointed<F, Fut>(
        &self,
        label: &str,
        ctx: PipelineContext,
        restore: Option<&CheckpointRecord>,
        body: F,
    ) -> PipelineResult<(PipelineContext, CheckpointRecord)>
    where
        F: FnOnce(PipelineContext) -> Fut,
        Fut: Future<Output = PipelineResult<PipelineContext>>,
    {
        let _live = self.live.lock().await;

        self.dispatcher.reserve(
            &StoreServiceJob {
                kind: JobKind::PrimaryStore,
            },
            &ctx,
            label,
        )?;

        let (ctx, snapshot) = if self.service.requires_live_service() {
            let restore_from = restore.and_then(|r| r.snapshot.as_ref());
            info!(
                checkpoint = label,
                restore = ?restore_from.map(|s| s.path()),
                "starting primary store"
            );
            let connection = self.service.start(restore_from).await?;

            let ctx = match body(ctx.with_primary_store(Some(connection))).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.stop_after_error(label).await;
                    return Err(e);
                }
            };

            if let Some(stats) = self.service.stats().await {
                info!(
                    checkpoint = label,
                    units = stats.units,
                    total_size = stats.total_size,
                    max_unit_size = stats.max_unit_size,
                    "store content before dump"
                );
            }
            let snapshot = match self.service.request_dump(label).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.stop_after_error(label).await;
                    return Err(e.into());
                }
            };
            self.service.stop().await?;
            self.wait_for_dump(&snapshot).await?;
            info!(checkpoint = label, snapshot = %snapshot, "snapshot ready");

            if let Some(archive) = &self.archive {
                archive
                    .export(snapshot.path(), &suffix::dump(label))
                    .await?;
            }
            (ctx, Some(snapshot))
        } else {
            let connection = self.service.descriptor();
            let ctx = body(ctx.with_primary_store(Some(connection))).await?;
            (ctx, None)
        };

        let record = CheckpointRecord::new(label, snapshot);
        let ctx = ctx
            .with_primary_store(None)
            .with_checkpoint(record.clone());

        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.snapshot_dir.clone(),
                source,
            })?;
        ctx.save(&context_path(&self.snapshot_dir, label))?;
        self.ledger.append(&record, STATUS_COMPLETED)?;

        Ok((ctx, record))
    }

    /// Stop the live store on a failure path. The original error wins.
    async fn stop_after_error(&self, label: &str) {
        if let Err(stop_err) = self.service.stop().await {
            warn!(checkpoint = label, error = %stop_err, "failed to stop store after error");
        }
    }

    /// Poll until the dump file is non-empty.
    async fn wait_for_dump(&self, snapshot: &SnapshotRef) -> Result<(), CheckpointError> {
        let mut attempts: u32 = 0;
        loop {
            let ready = tokio::fs::metadata(snapshot.path())
                .await
                .is_ok_and(|meta| meta.len() > 0);
            if ready {
                return Ok(());
            }
            attempts += 1;
            if self.policy.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(CheckpointError::DumpNeverMaterialized {
                    path: snapshot.path().to_path_buf(),
                    attempts,
                });
            }
            debug!(snapshot = %snapshot, attempt = attempts, "dump not ready yet");
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }
}
