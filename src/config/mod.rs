//! Pipeline configuration loaded from `flora.toml`.
//!
//! ```toml
//! [pipeline]
//! work_dir = "flora-work"
//! max_parallel = 4
//! tool_command = "flora-tool"
//! species_tree = "((human:0.006,chimp:0.007):0.1,gorilla:0.2);"
//! sequences = ["human.fa", "chimp.fa", "gorilla.fa"]
//!
//! [store]
//! kind = "command"
//! descriptor = "kt://localhost:1978/primary"
//! start_command = "store-ctl start"
//!
//! [constants]
//! default_memory = 2000000000
//!
//! [phases.bar]
//! run_bar = true
//! max_group_size = 200000
//!
//! [jobs.BarWrapper]
//! memory_cap = 8e9
//! ```
//!
//! Typed sections cover the pipeline and store wiring. Phase and job
//! tunables stay as attribute bags read through [`attributes::resolve`].

pub mod attributes;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::jobs::JobKind;
use crate::phase::{PhaseName, PhaseSpec};
use crate::resources::Feature;

pub use attributes::{
    AttributeBag, AttributeSource, FromAttribute, resolve, resolve_optional, resolve_required,
};

static EMPTY_BAG: AttributeBag = AttributeBag::empty();

/// The complete flora.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// The checkpointed primary store.
    #[serde(default)]
    pub store: StoreSection,
    /// The phase-scoped scratch store.
    #[serde(default)]
    pub secondary_store: StoreSection,
    /// Global fallbacks shared by all phases and jobs.
    #[serde(default)]
    pub constants: AttributeBag,
    #[serde(default)]
    pub phases: BTreeMap<String, AttributeBag>,
    #[serde(default)]
    pub jobs: BTreeMap<String, AttributeBag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Prefix for archived dumps and exported outputs. Archiving is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_results_url: Option<String>,
    /// Upper bound on concurrently running external programs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_tool_command")]
    pub tool_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
    /// Newick species tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species_tree: Option<String>,
    #[serde(default)]
    pub outgroups: Vec<String>,
    #[serde(default)]
    pub sequences: Vec<PathBuf>,
    /// Checkpoint ledger, relative to `work_dir` unless absolute.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("flora-work")
}

fn default_max_parallel() -> usize {
    4
}

fn default_tool_command() -> String {
    "flora-tool".to_string()
}

fn default_ledger_file() -> PathBuf {
    PathBuf::from("checkpoints.log")
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            intermediate_results_url: None,
            max_parallel: default_max_parallel(),
            tool_command: default_tool_command(),
            tool_timeout_secs: None,
            species_tree: None,
            outgroups: Vec::new(),
            sequences: Vec::new(),
            ledger_file: default_ledger_file(),
        }
    }
}

/// Which store implementation backs a store section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process store with JSON snapshots.
    #[default]
    Memory,
    /// External service driven by shell commands.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub kind: StoreKind,
    /// Whether the store holds transient state that must be started and dumped.
    #[serde(default = "default_live")]
    pub live: bool,
    #[serde(default = "default_descriptor")]
    pub descriptor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,
    /// Where dumps are written, relative to `work_dir` unless absolute.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_dump_poll_interval_ms")]
    pub dump_poll_interval_ms: u64,
    /// Poll limit for a dump to appear. Unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dump_polls: Option<u32>,
    /// JSON work tree loaded by the memory store on a fresh start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_tree: Option<PathBuf>,
}

fn default_live() -> bool {
    true
}

fn default_descriptor() -> String {
    "memory://primary".to_string()
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_dump_poll_interval_ms() -> u64 {
    10_000
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            live: default_live(),
            descriptor: default_descriptor(),
            start_command: None,
            dump_command: None,
            stop_command: None,
            snapshot_dir: default_snapshot_dir(),
            dump_poll_interval_ms: default_dump_poll_interval_ms(),
            max_dump_polls: None,
            seed_tree: None,
        }
    }
}

impl StoreSection {
    pub fn with_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = descriptor.into();
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Returns defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn phase_bag(&self, phase: PhaseName) -> &AttributeBag {
        self.phases.get(phase.as_str()).unwrap_or(&EMPTY_BAG)
    }

    pub fn job_bag(&self, kind: JobKind) -> &AttributeBag {
        self.jobs.get(kind.name()).unwrap_or(&EMPTY_BAG)
    }

    pub fn phase_spec(&self, phase: PhaseName) -> Result<PhaseSpec, ConfigError> {
        PhaseSpec::from_bag(phase, self.phase_bag(phase))
    }

    /// Resolve `path` against the work directory.
    pub fn work_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.pipeline.work_dir.join(path)
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.work_path(&self.pipeline.ledger_file)
    }

    pub fn snapshot_dir(&self, section: &StoreSection) -> PathBuf {
        self.work_path(&section.snapshot_dir)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_parallel == 0 {
            warnings.push("max_parallel must be at least 1".to_string());
        }

        for name in self.phases.keys() {
            match name.parse::<PhaseName>() {
                Ok(phase) if phase.as_str() == name => {}
                _ => warnings.push(format!("Unknown phase section [phases.{}]", name)),
            }
        }

        for phase in PhaseName::SEQUENCE {
            match self.phase_spec(phase) {
                Ok(spec) => {
                    if spec.tunables.max_group_size < spec.tunables.min_unit_size {
                        warnings.push(format!(
                            "phases.{}: max_group_size {} is below min_unit_size {}",
                            phase, spec.tunables.max_group_size, spec.tunables.min_unit_size
                        ));
                    }
                    if spec.tunables.max_group_size == 0 {
                        warnings.push(format!("phases.{}: max_group_size must be positive", phase));
                    }
                }
                Err(e) => warnings.push(e.to_string()),
            }
        }

        for (name, bag) in &self.jobs {
            if JobKind::from_name(name).is_none() {
                warnings.push(format!("Unknown job section [jobs.{}]", name));
                continue;
            }
            let source = AttributeSource::new(name, bag);
            if let Err(e) = resolve_optional::<Vec<f64>>(&[(source, "memory_poly")]) {
                warnings.push(e.to_string());
            }
            if let Ok(Some(feature)) = resolve_optional::<String>(&[(source, "memory_feature")]) {
                if feature.parse::<Feature>().is_err() {
                    warnings.push(format!("jobs.{}: unknown memory_feature '{}'", name, feature));
                }
            }
        }

        for (label, section) in [("store", &self.store), ("secondary_store", &self.secondary_store)] {
            if section.kind == StoreKind::Command && section.live && section.start_command.is_none()
            {
                warnings.push(format!("[{}] is a live command store without start_command", label));
            }
            if section.dump_poll_interval_ms == 0 {
                warnings.push(format!("[{}] dump_poll_interval_ms must be positive", label));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[pipeline]
work_dir = "/tmp/flora"
max_parallel = 8
species_tree = "(a:0.1,b:0.2);"
sequences = ["a.fa", "b.fa"]

[store]
kind = "command"
descriptor = "kt://localhost:1978/primary"
start_command = "store start"
max_dump_polls = 5

[constants]
default_memory = 2000000000

[phases.bar]
run_bar = "1"
max_group_size = 200

[jobs.BarWrapper]
memory_cap = 8e9
"#;

    #[test]
    fn test_parse_sample() {
        let config = PipelineConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.pipeline.max_parallel, 8);
        assert_eq!(config.pipeline.sequences.len(), 2);
        assert_eq!(config.store.kind, StoreKind::Command);
        assert_eq!(config.store.max_dump_polls, Some(5));
        assert_eq!(config.secondary_store.kind, StoreKind::Memory);
        assert!(config.phase_spec(PhaseName::Bar).unwrap().recurses);
        assert!(config.job_bag(JobKind::BarWrapper).contains("memory_cap"));
        assert!(config.job_bag(JobKind::CafWrapper).is_empty());
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_paths_resolve_against_work_dir() {
        let config = PipelineConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.ledger_path(), PathBuf::from("/tmp/flora/checkpoints.log"));
        assert_eq!(
            config.snapshot_dir(&config.store),
            PathBuf::from("/tmp/flora/snapshots")
        );
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::load_or_default(&dir.path().join("flora.toml")).unwrap();
        assert_eq!(config.pipeline.max_parallel, 4);
        assert!(config.store.live);
    }

    #[test]
    fn test_load_reports_parse_error_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flora.toml");
        std::fs::write(&path, "[pipeline\nmax_parallel = 1").unwrap();
        match PipelineConfig::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_flags_problems() {
        let config = PipelineConfig::parse(
            r#"
[pipeline]
max_parallel = 0

[store]
kind = "command"

[phases.bar]
min_unit_size = 500
max_group_size = 100

[phases.blast]
x = 1

[jobs.Unknown]
memory = 1

[jobs.CafWrapper]
memory_feature = "flowerSize"
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("max_parallel")));
        assert!(warnings.iter().any(|w| w.contains("below min_unit_size")));
        assert!(warnings.iter().any(|w| w.contains("[phases.blast]")));
        assert!(warnings.iter().any(|w| w.contains("[jobs.Unknown]")));
        assert!(warnings.iter().any(|w| w.contains("flowerSize")));
        assert!(warnings.iter().any(|w| w.contains("start_command")));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = PipelineConfig::parse(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = PipelineConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.pipeline.max_parallel, 8);
        assert_eq!(reparsed.store.descriptor, "kt://localhost:1978/primary");
    }
}
