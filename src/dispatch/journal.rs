//! Record of every task the dispatcher submitted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::jobs::JobKind;
use crate::phase::PhaseName;
use crate::resources::ResourceRequest;

/// Outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted without running a program (store services, recursion bookkeeping).
    Reserved,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub phase: PhaseName,
    /// Encoded unit names.
    pub units: String,
    pub request: ResourceRequest,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TaskRecord {
    pub fn reserved(kind: JobKind, phase: PhaseName, units: &str, request: ResourceRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            phase,
            units: units.to_string(),
            request,
            status: TaskStatus::Reserved,
            error: None,
            artifacts: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn completed(mut self, artifacts: usize, duration: Duration) -> Self {
        self.status = TaskStatus::Completed;
        self.artifacts = artifacts;
        self.duration = duration;
        self
    }

    pub fn failed(mut self, error: &str, duration: Duration) -> Self {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.duration = duration;
        self
    }
}

/// Totals over a journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalSummary {
    pub total: usize,
    pub reserved: usize,
    pub completed: usize,
    pub failed: usize,
    /// Largest bounded memory request.
    pub peak_memory: Option<u64>,
    /// Tasks with no memory bound.
    pub unbounded: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub by_kind: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
}

impl JournalSummary {
    pub fn add_record(&mut self, record: &TaskRecord) {
        self.total += 1;
        match record.status {
            TaskStatus::Reserved => self.reserved += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
        match record.request.memory {
            Some(memory) => {
                self.peak_memory = Some(self.peak_memory.map_or(memory, |p| p.max(memory)));
            }
            None => self.unbounded += 1,
        }
        self.duration += record.duration;
        *self.by_kind.entry(record.kind.to_string()).or_default() += 1;
        *self.by_phase.entry(record.phase.to_string()).or_default() += 1;
    }
}

impl fmt::Display for JournalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tasks ({} completed, {} reserved, {} failed)",
            self.total, self.completed, self.reserved, self.failed
        )?;
        match self.peak_memory {
            Some(peak) => writeln!(f, "peak memory request: {:.2}G", peak as f64 / 1e9)?,
            None => writeln!(f, "peak memory request: none")?,
        }
        if self.unbounded > 0 {
            writeln!(f, "unbounded memory requests: {}", self.unbounded)?;
        }
        for (phase, count) in &self.by_phase {
            writeln!(f, "  phase {:<10} {:>6}", phase, count)?;
        }
        for (kind, count) in &self.by_kind {
            writeln!(f, "  {:<26} {:>6}", kind, count)?;
        }
        Ok(())
    }
}

/// Append-only, shared across concurrently running tasks.
#[derive(Debug, Default)]
pub struct DispatchJournal {
    records: Mutex<Vec<TaskRecord>>,
}

impl DispatchJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: TaskRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> JournalSummary {
        let mut summary = JournalSummary::default();
        for record in self.records() {
            summary.add_record(&record);
        }
        summary
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let json = serde_json::to_string_pretty(&self.records())
            .context("Failed to serialize dispatch journal")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write journal to {}", path.display()))
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
