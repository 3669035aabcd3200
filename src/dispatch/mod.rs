//! Task submission.
//!
//! - `dispatcher`: resource estimation, the concurrency bound and tool runs
//! - `journal`: per-task records and their summary

pub mod dispatcher;
pub mod journal;

pub use dispatcher::Dispatcher;
pub use journal::{DispatchJournal, ExecutionTimer, JournalSummary, TaskRecord, TaskStatus};
