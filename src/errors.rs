//! Typed error hierarchy for the flora pipeline.
//!
//! One enum per failure class:
//! - `ConfigError`: attribute or config file problems, raised before dispatch
//! - `DecompositionError`: inconsistent unit grouping, always fatal
//! - `ResourceEstimationError`: bad polynomial or feature, raised at submission
//! - `CheckpointError`: store lifecycle and snapshot failures
//! - `ExternalToolError`: opaque failures of external compute programs
//!
//! `PipelineError` wraps all of them for the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

use crate::units::UnitId;

/// Configuration could not be read or an attribute is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Required attribute '{key}' missing from {location}")]
    Missing { location: String, key: String },

    #[error("Attribute '{key}' in {location} is not a valid {expected}")]
    TypeMismatch {
        location: String,
        key: String,
        expected: &'static str,
    },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The work tree could not be partitioned consistently.
#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Secondary grouping consumed {consumed} units, expected {expected}")]
    UnitCountMismatch { expected: usize, consumed: usize },

    #[error("Unit {id} appears more than once in the unit list")]
    DuplicateUnit { id: UnitId },

    #[error("Decomposition produced {produced} units, expected {expected}")]
    CoverageMismatch { expected: usize, produced: usize },

    #[error("Malformed unit names: {0}")]
    MalformedUnitNames(String),

    #[error("Malformed sub-item line: '{line}'")]
    MalformedSubItem { line: String },

    #[error("Malformed child unit line: '{line}'")]
    MalformedChildLine { line: String },
}

/// A resource model could not be evaluated for a job.
#[derive(Debug, Error)]
pub enum ResourceEstimationError {
    #[error("Memory polynomial for {job} has no coefficients")]
    EmptyPolynomial { job: String },

    #[error("Coefficient {index} of the memory polynomial for {job} is not finite")]
    NonFiniteCoefficient { job: String, index: usize },

    #[error("Unknown feature '{name}'")]
    UnknownFeature { name: String },

    #[error("Feature '{feature}' is not available for this job")]
    UnresolvedFeature { feature: String },

    #[error("Memory estimate for {job} is not a finite non-negative number")]
    NonFiniteEstimate { job: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures around the live store and its durable snapshots.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Snapshot at {path} still empty after {attempts} polls")]
    DumpNeverMaterialized { path: PathBuf, attempts: u32 },

    #[error("Snapshot I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store {action} command failed with code {code}: {stderr}")]
    ServiceCommand {
        action: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("Store {descriptor} is not live")]
    NotLive { descriptor: String },

    #[error("Invalid snapshot at {path}: {message}")]
    Snapshot { path: PathBuf, message: String },
}

/// An external compute program failed. Propagated as-is, never retried.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {secs} seconds")]
    TimedOut { program: String, secs: u64 },

    #[error("{program} produced unusable output: {message}")]
    Protocol { program: String, message: String },
}

/// Any failure that halts the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    #[error(transparent)]
    Resource(#[from] ResourceEstimationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Tool(#[from] ExternalToolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
