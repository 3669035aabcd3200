//! Splitting a unit list into bounded dispatch groups.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{AttributeSource, PipelineConfig, resolve};
use crate::errors::{ConfigError, DecompositionError};
use crate::jobs::JobKind;
use crate::phase::PhaseName;
use crate::units::WorkUnit;

/// Size bounds used when grouping one tier of the work tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingThresholds {
    pub min_unit_size: u64,
    pub max_group_size: u64,
    pub max_secondary_group_size: u64,
}

impl GroupingThresholds {
    pub fn new(min_unit_size: u64, max_group_size: u64) -> Self {
        Self {
            min_unit_size,
            max_group_size,
            max_secondary_group_size: max_group_size,
        }
    }

    pub fn with_secondary(mut self, max_secondary_group_size: u64) -> Self {
        self.max_secondary_group_size = max_secondary_group_size;
        self
    }

    /// The same bounds with no minimum, for regrouping units already admitted.
    pub fn without_minimum(mut self) -> Self {
        self.min_unit_size = 0;
        self
    }

    /// Thresholds for `kind` in `phase`: job bag first, then the phase tunables.
    pub fn resolve(
        config: &PipelineConfig,
        phase: PhaseName,
        kind: JobKind,
    ) -> Result<Self, ConfigError> {
        let tunables = config.phase_spec(phase)?.tunables;
        let location = format!("jobs.{}", kind);
        let job = AttributeSource::new(&location, config.job_bag(kind));
        Ok(Self {
            min_unit_size: resolve(&[(job, "min_unit_size")], tunables.min_unit_size)?,
            max_group_size: resolve(&[(job, "max_group_size")], tunables.max_group_size)?,
            max_secondary_group_size: resolve(
                &[(job, "max_secondary_group_size")],
                tunables.max_secondary_group_size,
            )?,
        })
    }
}

/// A batch of units bounded by `max_group_size`, or one unit too big for any batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "units")]
pub enum DispatchGroup {
    Batch(Vec<WorkUnit>),
    Oversize(WorkUnit),
}

impl DispatchGroup {
    pub fn units(&self) -> &[WorkUnit] {
        match self {
            DispatchGroup::Batch(units) => units,
            DispatchGroup::Oversize(unit) => std::slice::from_ref(unit),
        }
    }

    pub fn is_oversize(&self) -> bool {
        matches!(self, DispatchGroup::Oversize(_))
    }

    pub fn total_size(&self) -> u64 {
        self.units().iter().map(|u| u.size).sum()
    }

    pub fn len(&self) -> usize {
        self.units().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units().is_empty()
    }
}

/// Partition `units` into dispatch groups, preserving order.
///
/// Units smaller than `min_unit_size` are dropped. Consecutive units fill a
/// batch until the next one would push it past `max_group_size`; a unit
/// larger than `max_group_size` on its own becomes an oversize group.
pub fn decompose(
    units: &[WorkUnit],
    thresholds: &GroupingThresholds,
) -> Result<Vec<DispatchGroup>, DecompositionError> {
    let mut seen = HashSet::with_capacity(units.len());
    for unit in units {
        if !seen.insert(unit.id) {
            return Err(DecompositionError::DuplicateUnit { id: unit.id });
        }
    }

    let kept: Vec<WorkUnit> = units
        .iter()
        .filter(|u| u.size >= thresholds.min_unit_size)
        .copied()
        .collect();

    let mut groups = Vec::new();
    let mut batch: Vec<WorkUnit> = Vec::new();
    let mut batch_size: u64 = 0;

    for unit in &kept {
        if unit.size > thresholds.max_group_size {
            if !batch.is_empty() {
                groups.push(DispatchGroup::Batch(std::mem::take(&mut batch)));
                batch_size = 0;
            }
            groups.push(DispatchGroup::Oversize(*unit));
            continue;
        }
        if !batch.is_empty() && batch_size + unit.size > thresholds.max_group_size {
            groups.push(DispatchGroup::Batch(std::mem::take(&mut batch)));
            batch_size = 0;
        }
        batch_size += unit.size;
        batch.push(*unit);
    }
    if !batch.is_empty() {
        groups.push(DispatchGroup::Batch(batch));
    }

    let produced: usize = groups.iter().map(DispatchGroup::len).sum();
    if produced != kept.len()
        || groups
            .iter()
            .flat_map(|g| g.units().iter())
            .zip(&kept)
            .any(|(a, b)| a.id != b.id)
    {
        return Err(DecompositionError::CoverageMismatch {
            expected: kept.len(),
            produced,
        });
    }

    Ok(groups)
}

/// Unit counts per secondary group when splitting by size.
///
/// Same packing rule as [`decompose`]: a unit too big for the bound sits alone.
pub fn secondary_layout(units: &[WorkUnit], max_secondary_group_size: u64) -> Vec<usize> {
    let mut layout = Vec::new();
    let mut count = 0usize;
    let mut size = 0u64;
    for unit in units {
        if count > 0 && size + unit.size > max_secondary_group_size {
            layout.push(count);
            count = 0;
            size = 0;
        }
        count += 1;
        size += unit.size;
    }
    if count > 0 {
        layout.push(count);
    }
    layout
}

/// Slice `units` into consecutive groups of the given counts.
///
/// The counts must consume the unit list exactly. Empty slots are skipped.
pub fn split_secondary(
    units: &[WorkUnit],
    layout: &[usize],
) -> Result<Vec<Vec<WorkUnit>>, DecompositionError> {
    let mut groups = Vec::with_capacity(layout.len());
    let mut consumed = 0usize;
    for &count in layout {
        let end = consumed + count;
        if end > units.len() {
            return Err(DecompositionError::UnitCountMismatch {
                expected: units.len(),
                consumed: end,
            });
        }
        if count > 0 {
            groups.push(units[consumed..end].to_vec());
        }
        consumed = end;
    }
    if consumed != units.len() {
        return Err(DecompositionError::UnitCountMismatch {
            expected: units.len(),
            consumed,
        });
    }
    Ok(groups)
}
