//! The versioned state threaded through the phases.
//!
//! A `PipelineContext` is never shared mutably: each phase receives one by
//! value and hands back a successor. Every `with_*` call bumps the version,
//! and output handles only ever accumulate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointRecord;
use crate::services::{ArtifactHandle, StoreConnection};

/// Named outputs accumulated across phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Alignments,
    OutgroupFragments,
    IngroupCoverage,
    Constraints,
    Reference,
    HalFasta,
    Hal,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Alignments => "alignments",
            OutputKind::OutgroupFragments => "outgroup_fragments",
            OutputKind::IngroupCoverage => "ingroup_coverage",
            OutputKind::Constraints => "constraints",
            OutputKind::Reference => "reference",
            OutputKind::HalFasta => "hal_fasta",
            OutputKind::Hal => "hal",
        }
    }

    /// Map an artifact kind reported by a tool.
    pub fn from_artifact_kind(kind: &str) -> Option<OutputKind> {
        [
            OutputKind::Alignments,
            OutputKind::OutgroupFragments,
            OutputKind::IngroupCoverage,
            OutputKind::Constraints,
            OutputKind::Reference,
            OutputKind::HalFasta,
            OutputKind::Hal,
        ]
        .into_iter()
        .find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    version: u64,
    #[serde(default)]
    primary_store: Option<StoreConnection>,
    #[serde(default)]
    secondary_store: Option<StoreConnection>,
    #[serde(default)]
    total_input_size: u64,
    /// Longest root-to-leaf distance of the species tree.
    #[serde(default)]
    divergence: Option<f64>,
    /// Minimum percent identity passed to the blast step.
    #[serde(default)]
    identity_filter: Option<u32>,
    /// Input sequences after id prefixing.
    #[serde(default)]
    sequences: Vec<PathBuf>,
    #[serde(default)]
    outputs: BTreeMap<OutputKind, ArtifactHandle>,
    /// Whether the normal phase ran at least once.
    #[serde(default)]
    normalised: bool,
    #[serde(default)]
    last_checkpoint: Option<CheckpointRecord>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn primary_store(&self) -> Option<&StoreConnection> {
        self.primary_store.as_ref()
    }

    pub fn secondary_store(&self) -> Option<&StoreConnection> {
        self.secondary_store.as_ref()
    }

    pub fn total_input_size(&self) -> u64 {
        self.total_input_size
    }

    pub fn divergence(&self) -> Option<f64> {
        self.divergence
    }

    pub fn identity_filter(&self) -> Option<u32> {
        self.identity_filter
    }

    pub fn sequences(&self) -> &[PathBuf] {
        &self.sequences
    }

    pub fn output(&self, kind: OutputKind) -> Option<&ArtifactHandle> {
        self.outputs.get(&kind)
    }

    pub fn outputs(&self) -> &BTreeMap<OutputKind, ArtifactHandle> {
        &self.outputs
    }

    pub fn normalised(&self) -> bool {
        self.normalised
    }

    pub fn last_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.last_checkpoint.as_ref()
    }

    fn bump(mut self) -> Self {
        self.version += 1;
        self
    }

    pub fn with_primary_store(mut self, connection: Option<StoreConnection>) -> Self {
        self.primary_store = connection;
        self.bump()
    }

    pub fn with_secondary_store(mut self, connection: Option<StoreConnection>) -> Self {
        self.secondary_store = connection;
        self.bump()
    }

    pub fn with_total_input_size(mut self, size: u64) -> Self {
        self.total_input_size = size;
        self.bump()
    }

    pub fn with_divergence(mut self, divergence: f64) -> Self {
        self.divergence = Some(divergence);
        self.bump()
    }

    pub fn with_identity_filter(mut self, identity: Option<u32>) -> Self {
        self.identity_filter = identity;
        self.bump()
    }

    pub fn with_sequences(mut self, sequences: Vec<PathBuf>) -> Self {
        self.sequences = sequences;
        self.bump()
    }

    /// Record an output. A later handle of the same kind replaces the earlier one.
    pub fn with_output(mut self, kind: OutputKind, artifact: ArtifactHandle) -> Self {
        self.outputs.insert(kind, artifact);
        self.bump()
    }

    /// Record every artifact whose kind names a pipeline output.
    pub fn with_artifacts<'a>(self, artifacts: impl IntoIterator<Item = &'a ArtifactHandle>) -> Self {
        artifacts.into_iter().fold(self, |ctx, artifact| {
            match OutputKind::from_artifact_kind(&artifact.kind) {
                Some(kind) => ctx.with_output(kind, artifact.clone()),
                None => ctx,
            }
        })
    }

    pub fn with_normalised(mut self, normalised: bool) -> Self {
        self.normalised = normalised;
        self.bump()
    }

    pub fn with_checkpoint(mut self, record: CheckpointRecord) -> Self {
        self.last_checkpoint = Some(record);
        self.bump()
    }

    /// Persist for resuming after a checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize context")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write context to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse context at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(kind: &str, path: &str) -> ArtifactHandle {
        ArtifactHandle::new(kind, PathBuf::from(path), 10)
    }

    #[test]
    fn test_every_update_bumps_version() {
        let ctx = PipelineContext::new();
        assert_eq!(ctx.version(), 0);
        let ctx = ctx
            .with_total_input_size(100)
            .with_divergence(0.3)
            .with_primary_store(Some(StoreConnection::new("mem://a")));
        assert_eq!(ctx.version(), 3);
        assert_eq!(ctx.total_input_size(), 100);
        assert_eq!(ctx.primary_store().map(|c| c.as_str()), Some("mem://a"));
    }

    #[test]
    fn test_outputs_accumulate() {
        let ctx = PipelineContext::new()
            .with_output(OutputKind::Alignments, artifact("alignments", "/a"))
            .with_primary_store(None)
            .with_output(OutputKind::Reference, artifact("reference", "/r"));
        assert!(ctx.output(OutputKind::Alignments).is_some());
        assert!(ctx.output(OutputKind::Reference).is_some());
        assert_eq!(ctx.outputs().len(), 2);
    }

    #[test]
    fn test_with_artifacts_ignores_unknown_kinds() {
        let artifacts = vec![
            artifact("alignments", "/a"),
            artifact("scratch", "/tmp/x"),
            artifact("ingroup_coverage", "/c"),
        ];
        let ctx = PipelineContext::new().with_artifacts(&artifacts);
        assert_eq!(ctx.outputs().len(), 2);
        assert!(ctx.output(OutputKind::IngroupCoverage).is_some());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("context.json");
        let ctx = PipelineContext::new()
            .with_total_input_size(42)
            .with_normalised(true)
            .with_output(OutputKind::Hal, artifact("hal", "/h"));
        ctx.save(&path).unwrap();
        let loaded = PipelineContext::load(&path).unwrap();
        assert_eq!(loaded, ctx);
    }
}
