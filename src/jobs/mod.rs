//! Job types and the capabilities they declare.
//!
//! Instead of a class hierarchy, each job struct implements the capability
//! traits it actually has:
//!
//! | Trait               | Meaning                                          |
//! |---------------------|--------------------------------------------------|
//! | `ResourceEstimable` | has a kind, a phase and input-size features      |
//! | `Recursable`        | walks the work tree with a `RecursionPlan`       |
//! | `Checkpointable`    | brackets its phases with a live primary store    |

mod kind;
mod plan;

pub use kind::JobKind;
pub use plan::{RecursionPlan, TraversalOrder, WrapperStep};

use crate::phase::{CheckpointGroup, PhaseName, PhaseSpec};
use crate::recursion::SubItem;
use crate::resources::{Feature, FeatureSet};
use crate::units::WorkUnit;

/// A job whose memory and CPU can be predicted before submission.
pub trait ResourceEstimable: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Feature values for this dispatch given the pipeline's total input size.
    fn features(&self, total_input_size: u64) -> FeatureSet;

    /// Oversize jobs draw on the separate overlarge default chain.
    fn oversize(&self) -> bool {
        false
    }

    fn checkpoint(&self) -> bool {
        false
    }

    fn phase(&self) -> PhaseName {
        self.kind().phase()
    }
}

/// A phase that recurses over the work tree.
pub trait Recursable {
    fn recursion_plan(&self) -> Option<RecursionPlan>;
}

/// A group of phases run against one live primary store.
pub trait Checkpointable {
    fn checkpoint_label(&self) -> &str;

    fn checkpoint_phases(&self) -> &[PhaseName];
}

impl Checkpointable for CheckpointGroup {
    fn checkpoint_label(&self) -> &str {
        self.label()
    }

    fn checkpoint_phases(&self) -> &[PhaseName] {
        self.phases()
    }
}

/// A configured phase. Recurses only when its gate is on.
#[derive(Debug, Clone)]
pub struct PhaseJob {
    pub spec: PhaseSpec,
}

impl PhaseJob {
    pub fn new(spec: PhaseSpec) -> Self {
        Self { spec }
    }
}

impl Recursable for PhaseJob {
    fn recursion_plan(&self) -> Option<RecursionPlan> {
        if self.spec.recurses {
            RecursionPlan::for_phase(self.spec.name)
        } else {
            None
        }
    }
}

/// A recursion or wrapper task over a group of work units.
#[derive(Debug, Clone)]
pub struct UnitJob {
    pub kind: JobKind,
    pub units: Vec<WorkUnit>,
    pub oversize: bool,
}

impl UnitJob {
    pub fn new(kind: JobKind, units: Vec<WorkUnit>, oversize: bool) -> Self {
        Self {
            kind,
            units,
            oversize,
        }
    }
}

impl ResourceEstimable for UnitJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn features(&self, total_input_size: u64) -> FeatureSet {
        FeatureSet::for_units(&self.units, total_input_size)
    }

    fn oversize(&self) -> bool {
        self.oversize
    }
}

/// An end-alignment task over sub-items reported by a diagnostic pass.
#[derive(Debug, Clone)]
pub struct SubItemJob {
    pub kind: JobKind,
    pub units: Vec<WorkUnit>,
    pub items: Vec<SubItem>,
    pub oversize: bool,
}

impl ResourceEstimable for SubItemJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn features(&self, total_input_size: u64) -> FeatureSet {
        let group: u64 = self.items.iter().map(|i| i.size).sum();
        let max = self.items.iter().map(|i| i.size).max().unwrap_or(0);
        FeatureSet::for_units(&self.units, total_input_size)
            .with(Feature::SubItemGroupSize, group as f64)
            .with(Feature::MaxSubItemSize, max as f64)
            .with(Feature::SubItemCount, self.items.len() as f64)
    }

    fn oversize(&self) -> bool {
        self.oversize
    }
}

/// A merge of precomputed partial results back into their parent units.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub kind: JobKind,
    pub units: Vec<WorkUnit>,
    pub precomputed_size: u64,
}

impl ResourceEstimable for MergeJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn features(&self, total_input_size: u64) -> FeatureSet {
        FeatureSet::for_units(&self.units, total_input_size)
            .with(Feature::PrecomputedSize, self.precomputed_size as f64)
    }
}

/// A single whole-input step such as blast, setup or fasta export.
#[derive(Debug, Clone, Copy)]
pub struct RootStepJob {
    pub kind: JobKind,
}

impl ResourceEstimable for RootStepJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn features(&self, total_input_size: u64) -> FeatureSet {
        FeatureSet::new().with(Feature::TotalInputSize, total_input_size as f64)
    }
}

/// A live store service. Checkpointed primaries restart from their snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StoreServiceJob {
    pub kind: JobKind,
}

impl ResourceEstimable for StoreServiceJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn features(&self, total_input_size: u64) -> FeatureSet {
        FeatureSet::new().with(Feature::TotalInputSize, total_input_size as f64)
    }

    fn checkpoint(&self) -> bool {
        self.kind == JobKind::PrimaryStore
    }
}
