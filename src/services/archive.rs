//! Copies of dumps and final outputs under the intermediate-results prefix.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::errors::CheckpointError;

/// Name suffixes of exported files.
pub mod suffix {
    pub const REFERENCE: &str = ".reference.fa";
    pub const HAL_FASTA: &str = ".hal.fa";
    pub const HAL: &str = ".c2h";

    pub fn dump(label: &str) -> String {
        format!("-dump-{}", label)
    }
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Copy `source` to the archive under `suffix`, returning the destination.
    async fn export(&self, source: &Path, suffix: &str) -> Result<PathBuf, CheckpointError>;
}

/// Writes `<prefix><suffix>` on the local filesystem.
pub struct FileArchive {
    prefix: String,
}

impl FileArchive {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn destination(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, suffix))
    }
}

#[async_trait]
impl ArchiveSink for FileArchive {
    async fn export(&self, source: &Path, suffix: &str) -> Result<PathBuf, CheckpointError> {
        let dest = self.destination(suffix);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CheckpointError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| CheckpointError::Io {
                path: source.to_path_buf(),
                source: e,
            })?;
        info!(from = %source.display(), to = %dest.display(), "archived");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_appends_suffix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("avg.json");
        std::fs::write(&source, "{}").unwrap();
        let prefix = dir.path().join("results").join("run1");
        let archive = FileArchive::new(prefix.display().to_string());

        let dest = archive.export(&source, &suffix::dump("avg")).await.unwrap();
        assert_eq!(dest, dir.path().join("results").join("run1-dump-avg"));
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_export_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let archive = FileArchive::new(dir.path().join("x").display().to_string());
        let err = archive
            .export(&dir.path().join("nope"), suffix::HAL)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }
}
