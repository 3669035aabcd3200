//! Batching of sub-items reported by a diagnostic pass.
//!
//! An oversize unit's computation is broken up: a diagnostic pass lists its
//! sub-items, small ones are accumulated into batches, and very large ones
//! are precomputed alone. The parent then merges every precomputed result.

use serde::{Deserialize, Serialize};

use crate::errors::DecompositionError;

/// One sub-item line of a diagnostic pass: `<id> <unit count> <size>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubItem {
    pub id: u64,
    pub unit_count: u64,
    pub size: u64,
}

impl SubItem {
    pub fn new(id: u64, unit_count: u64, size: u64) -> Self {
        Self {
            id,
            unit_count,
            size,
        }
    }

    pub fn parse(line: &str) -> Result<Self, DecompositionError> {
        let malformed = || DecompositionError::MalformedSubItem {
            line: line.to_string(),
        };
        let fields: Vec<u64> = line
            .split_whitespace()
            .map(|t| t.parse::<u64>().map_err(|_| malformed()))
            .collect::<Result<_, _>>()?;
        match fields.as_slice() {
            [id, unit_count, size] => Ok(Self::new(*id, *unit_count, *size)),
            _ => Err(malformed()),
        }
    }
}

/// A precomputation task produced by the batcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "items")]
pub enum ExtendingDispatch {
    /// A very large sub-item on its own.
    Isolated(SubItem),
    Batch(Vec<SubItem>),
}

impl ExtendingDispatch {
    pub fn items(&self) -> &[SubItem] {
        match self {
            ExtendingDispatch::Isolated(item) => std::slice::from_ref(item),
            ExtendingDispatch::Batch(items) => items,
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, ExtendingDispatch::Isolated(_))
    }
}

/// Streams sub-items into dispatches.
///
/// Items of at least `very_large_size` are isolated immediately. Others
/// accumulate until the batch reaches `max_group_size`.
#[derive(Debug, Clone)]
pub struct ExtendingBatcher {
    max_group_size: u64,
    very_large_size: u64,
    pending: Vec<SubItem>,
    pending_size: u64,
}

impl ExtendingBatcher {
    pub fn new(max_group_size: u64, very_large_size: u64) -> Self {
        Self {
            max_group_size,
            very_large_size,
            pending: Vec::new(),
            pending_size: 0,
        }
    }

    pub fn push(&mut self, item: SubItem) -> Option<ExtendingDispatch> {
        if item.size >= self.very_large_size {
            return Some(ExtendingDispatch::Isolated(item));
        }
        self.pending.push(item);
        self.pending_size += item.size;
        if self.pending_size >= self.max_group_size {
            self.pending_size = 0;
            return Some(ExtendingDispatch::Batch(std::mem::take(&mut self.pending)));
        }
        None
    }

    /// Flush the remainder.
    pub fn finish(self) -> Option<ExtendingDispatch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(ExtendingDispatch::Batch(self.pending))
        }
    }
}

/// Run a whole item list through a batcher.
pub fn plan_extension(
    items: impl IntoIterator<Item = SubItem>,
    max_group_size: u64,
    very_large_size: u64,
) -> Vec<ExtendingDispatch> {
    let mut batcher = ExtendingBatcher::new(max_group_size, very_large_size);
    let mut dispatches: Vec<ExtendingDispatch> =
        items.into_iter().filter_map(|item| batcher.push(item)).collect();
    dispatches.extend(batcher.finish());
    dispatches
}
