use serde::Serialize;

use super::JobKind;
use crate::phase::PhaseName;

/// How a recursion job orders its wrappers against its child recursions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    /// Wrappers run after every child subtree finished.
    ChildrenFirst,
    /// Child recursion starts after this level's wrappers finished.
    WrappersFirst,
    Concurrent,
}

/// How a level's own units are regrouped into wrapper tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "grouping")]
pub enum WrapperStep {
    /// One wrapper per dispatch group.
    Primary { kind: JobKind },
    /// Dispatch groups split again by `max_secondary_group_size`.
    Secondary { kind: JobKind },
    /// Oversize groups run a diagnostic pass and precompute partial results.
    Extending { normal: JobKind, oversize: JobKind },
}

impl WrapperStep {
    /// The job kind dispatched for a group.
    pub fn kind_for(&self, oversize: bool) -> JobKind {
        match self {
            WrapperStep::Primary { kind } | WrapperStep::Secondary { kind } => *kind,
            WrapperStep::Extending { normal, oversize: large } => {
                if oversize {
                    *large
                } else {
                    *normal
                }
            }
        }
    }
}

/// The shape of one phase's walk over the work tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecursionPlan {
    pub recursion: JobKind,
    pub order: TraversalOrder,
    pub wrapper: WrapperStep,
    /// Runs after both wrappers and children of a level.
    pub follow_up: Option<WrapperStep>,
}

impl RecursionPlan {
    pub fn for_phase(phase: PhaseName) -> Option<RecursionPlan> {
        let plan = match phase {
            PhaseName::Bar => RecursionPlan {
                recursion: JobKind::BarRecursion,
                order: TraversalOrder::Concurrent,
                wrapper: WrapperStep::Extending {
                    normal: JobKind::BarWrapper,
                    oversize: JobKind::BarWrapperLarge,
                },
                follow_up: None,
            },
            PhaseName::Normal => RecursionPlan {
                recursion: JobKind::NormalRecursion,
                order: TraversalOrder::ChildrenFirst,
                wrapper: WrapperStep::Primary {
                    kind: JobKind::NormalWrapper,
                },
                follow_up: None,
            },
            PhaseName::Avg => RecursionPlan {
                recursion: JobKind::AvgRecursion,
                order: TraversalOrder::WrappersFirst,
                wrapper: WrapperStep::Secondary {
                    kind: JobKind::AvgWrapper,
                },
                follow_up: None,
            },
            PhaseName::Reference => RecursionPlan {
                recursion: JobKind::ReferenceRecursion,
                order: TraversalOrder::WrappersFirst,
                wrapper: WrapperStep::Secondary {
                    kind: JobKind::ReferenceWrapper,
                },
                follow_up: Some(WrapperStep::Secondary {
                    kind: JobKind::CoordinatesUp,
                }),
            },
            PhaseName::Check => RecursionPlan {
                recursion: JobKind::CheckRecursion,
                order: TraversalOrder::Concurrent,
                wrapper: WrapperStep::Primary {
                    kind: JobKind::CheckWrapper,
                },
                follow_up: None,
            },
            PhaseName::Hal => RecursionPlan {
                recursion: JobKind::HalRecursion,
                order: TraversalOrder::ChildrenFirst,
                wrapper: WrapperStep::Primary {
                    kind: JobKind::HalUpWrapper,
                },
                follow_up: None,
            },
            PhaseName::TrimBlast | PhaseName::Setup | PhaseName::Caf => return None,
        };
        Some(plan)
    }

    /// Pre-order pass that pushes reference coordinates down the tree.
    pub fn coordinates_down() -> RecursionPlan {
        RecursionPlan {
            recursion: JobKind::CoordinatesDownRecursion,
            order: TraversalOrder::WrappersFirst,
            wrapper: WrapperStep::Secondary {
                kind: JobKind::CoordinatesDown,
            },
            follow_up: None,
        }
    }
}
