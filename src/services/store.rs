//! Store seams: the work-tree store and the lifecycle of a live store service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::tool::{ComputeTool, ToolInvocation};
use crate::errors::{CheckpointError, DecompositionError, PipelineResult};
use crate::units::WorkUnit;

/// Connection string of a running store, handed to every program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreConnection(String);

impl StoreConnection {
    pub fn new(connection: impl Into<String>) -> Self {
        Self(connection.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of a durable store dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub path: PathBuf,
}

impl SnapshotRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Summary logged before a dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub parents: usize,
    pub units: usize,
    pub total_size: u64,
    pub max_unit_size: u64,
    pub records: usize,
}

/// A store service whose transient state is bracketed by start and dump.
#[async_trait]
pub trait StoreService: Send + Sync {
    /// `false` for durable stores: start, dump and stop become no-ops.
    fn requires_live_service(&self) -> bool;

    fn descriptor(&self) -> StoreConnection;

    /// Start the service, restoring from `restore` when given.
    async fn start(&self, restore: Option<&SnapshotRef>) -> Result<StoreConnection, CheckpointError>;

    /// Ask the service to write a dump. The file may appear later.
    async fn request_dump(&self, label: &str) -> Result<SnapshotRef, CheckpointError>;

    async fn stop(&self) -> Result<(), CheckpointError>;

    async fn stats(&self) -> Option<StoreStats> {
        None
    }
}

/// Read access to the work tree held in a store.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Children of every parent, in parent order.
    async fn child_units(
        &self,
        store: Option<&StoreConnection>,
        parents: &[WorkUnit],
    ) -> PipelineResult<Vec<WorkUnit>>;

    /// Store-defined secondary grouping. `None` falls back to size packing.
    async fn secondary_layout(
        &self,
        _store: Option<&StoreConnection>,
        _units: &[WorkUnit],
        _max_secondary_group_size: u64,
    ) -> PipelineResult<Option<Vec<usize>>> {
        Ok(None)
    }
}

/// Program that lists the children of a unit set.
pub const GET_CHILDREN_PROGRAM: &str = "get-children";

/// Queries children through the `get-children` program.
///
/// The program prints one `<id> <size>` line per child.
pub struct ToolUnitStore {
    tool: Arc<dyn ComputeTool>,
}

impl ToolUnitStore {
    pub fn new(tool: Arc<dyn ComputeTool>) -> Self {
        Self { tool }
    }
}

fn parse_child_line(line: &str) -> Result<WorkUnit, DecompositionError> {
    let malformed = || DecompositionError::MalformedChildLine {
        line: line.to_string(),
    };
    let mut fields = line.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(id)), Some(Ok(size)), None) => Ok(WorkUnit::new(id, size)),
        _ => Err(malformed()),
    }
}

#[async_trait]
impl UnitStore for ToolUnitStore {
    async fn child_units(
        &self,
        store: Option<&StoreConnection>,
        parents: &[WorkUnit],
    ) -> PipelineResult<Vec<WorkUnit>> {
        if parents.is_empty() {
            return Ok(Vec::new());
        }
        let invocation = ToolInvocation::new(GET_CHILDREN_PROGRAM)
            .with_store(store)
            .with_units(parents.iter().map(|u| u.id));
        let output = self.tool.run(&invocation).await?;
        let children = output
            .messages
            .iter()
            .map(|line| parse_child_line(line))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(children)
    }
}
