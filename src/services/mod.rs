//! Collaborators behind trait seams: compute programs, stores, archives.

pub mod archive;
pub mod command;
pub mod memory;
pub mod store;
pub mod tool;

pub use archive::{ArchiveSink, FileArchive, suffix};
pub use command::CommandStoreService;
pub use memory::{MemoryStore, StoreContent};
pub use store::{
    GET_CHILDREN_PROGRAM, SnapshotRef, StoreConnection, StoreService, StoreStats, ToolUnitStore,
    UnitStore,
};
pub use tool::{ArtifactHandle, ComputeTool, DryRunTool, ProcessTool, ToolInvocation, ToolOutput};
