//! A store service driven by shell commands.
//!
//! Each lifecycle step runs its configured command through `sh -c` with:
//! - `FLORA_STORE`: the store descriptor
//! - `FLORA_RESTORE`: snapshot to restore on start, empty for a fresh start
//! - `FLORA_DUMP_PATH`: where the dump command must write its snapshot
//!
//! The dump command may return before the file is complete; the checkpoint
//! manager polls for it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::store::{SnapshotRef, StoreConnection, StoreService};
use crate::config::StoreSection;
use crate::errors::CheckpointError;

pub struct CommandStoreService {
    section: StoreSection,
    snapshot_dir: PathBuf,
    working_dir: PathBuf,
}

impl CommandStoreService {
    pub fn new(
        section: StoreSection,
        snapshot_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            section,
            snapshot_dir: snapshot_dir.into(),
            working_dir: working_dir.into(),
        }
    }

    async fn run_command(
        &self,
        action: &'static str,
        command: Option<&str>,
        envs: &[(&str, String)],
    ) -> Result<(), CheckpointError> {
        let Some(command) = command else {
            return Ok(());
        };

        debug!(action, command, "running store command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .env("FLORA_STORE", &self.section.descriptor)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CheckpointError::ServiceCommand {
                action,
                code: -1,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CheckpointError::ServiceCommand {
                action,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreService for CommandStoreService {
    fn requires_live_service(&self) -> bool {
        self.section.live
    }

    fn descriptor(&self) -> StoreConnection {
        StoreConnection::new(&self.section.descriptor)
    }

    async fn start(&self, restore: Option<&SnapshotRef>) -> Result<StoreConnection, CheckpointError> {
        let restore = restore
            .map(|s| s.path().display().to_string())
            .unwrap_or_default();
        self.run_command(
            "start",
            self.section.start_command.as_deref(),
            &[("FLORA_RESTORE", restore)],
        )
        .await?;
        Ok(self.descriptor())
    }

    async fn request_dump(&self, label: &str) -> Result<SnapshotRef, CheckpointError> {
        let path = self.snapshot_dir.join(format!("{}.snapshot", label));
        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.snapshot_dir.clone(),
                source,
            })?;
        // A stale dump from an earlier run would satisfy the poll immediately.
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CheckpointError::Io { path, source }),
        }
        self.run_command(
            "dump",
            self.section.dump_command.as_deref(),
            &[("FLORA_DUMP_PATH", path.display().to_string())],
        )
        .await?;
        Ok(SnapshotRef::new(path))
    }

    async fn stop(&self) -> Result<(), CheckpointError> {
        self.run_command("stop", self.section.stop_command.as_deref(), &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn section(dump: &str) -> StoreSection {
        StoreSection {
            start_command: Some("test -z \"$FLORA_RESTORE\" || test -f \"$FLORA_RESTORE\"".into()),
            dump_command: Some(dump.into()),
            stop_command: Some("true".into()),
            ..StoreSection::default().with_descriptor("cmd://primary")
        }
    }

    #[tokio::test]
    async fn test_dump_command_receives_path() {
        let dir = TempDir::new().unwrap();
        let service = CommandStoreService::new(
            section("echo \"$FLORA_STORE\" > \"$FLORA_DUMP_PATH\""),
            dir.path().join("snaps"),
            dir.path(),
        );
        let conn = service.start(None).await.unwrap();
        assert_eq!(conn.as_str(), "cmd://primary");
        let snapshot = service.request_dump("caf").await.unwrap();
        let written = std::fs::read_to_string(snapshot.path()).unwrap();
        assert_eq!(written.trim(), "cmd://primary");
        service.stop().await.unwrap();
        service.start(Some(&snapshot)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_reports_action() {
        let dir = TempDir::new().unwrap();
        let service =
            CommandStoreService::new(section("echo boom >&2; exit 2"), dir.path(), dir.path());
        let err = service.request_dump("caf").await.unwrap_err();
        match err {
            CheckpointError::ServiceCommand {
                action,
                code,
                stderr,
            } => {
                assert_eq!(action, "dump");
                assert_eq!(code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("Expected ServiceCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_commands_are_no_ops() {
        let dir = TempDir::new().unwrap();
        let service = CommandStoreService::new(StoreSection::default(), dir.path(), dir.path());
        service.start(None).await.unwrap();
        service.stop().await.unwrap();
    }
}
