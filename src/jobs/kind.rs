//! Job types known to the pipeline and their built-in resource profiles.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phase::PhaseName;
use crate::resources::{Feature, ResourcePolynomial};

/// Every kind of task the pipeline dispatches.
///
/// The `Display` name doubles as the key of the job's `[jobs.<name>]`
/// config bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
    Blast,
    Setup,
    CafPhase,
    CafWrapper,
    BarRecursion,
    BarWrapper,
    BarWrapperLarge,
    BarEndAligner,
    BarWithPrecomputed,
    NormalRecursion,
    NormalWrapper,
    AvgRecursion,
    AvgWrapper,
    ReferenceRecursion,
    ReferenceWrapper,
    CoordinatesUp,
    CoordinatesDownRecursion,
    CoordinatesDown,
    ExtractReference,
    CheckRecursion,
    CheckWrapper,
    FastaGenerator,
    HalRecursion,
    HalUpWrapper,
    PrimaryStore,
    SecondaryStore,
}

impl JobKind {
    pub const ALL: [JobKind; 26] = [
        JobKind::Blast,
        JobKind::Setup,
        JobKind::CafPhase,
        JobKind::CafWrapper,
        JobKind::BarRecursion,
        JobKind::BarWrapper,
        JobKind::BarWrapperLarge,
        JobKind::BarEndAligner,
        JobKind::BarWithPrecomputed,
        JobKind::NormalRecursion,
        JobKind::NormalWrapper,
        JobKind::AvgRecursion,
        JobKind::AvgWrapper,
        JobKind::ReferenceRecursion,
        JobKind::ReferenceWrapper,
        JobKind::CoordinatesUp,
        JobKind::CoordinatesDownRecursion,
        JobKind::CoordinatesDown,
        JobKind::ExtractReference,
        JobKind::CheckRecursion,
        JobKind::CheckWrapper,
        JobKind::FastaGenerator,
        JobKind::HalRecursion,
        JobKind::HalUpWrapper,
        JobKind::PrimaryStore,
        JobKind::SecondaryStore,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Blast => "Blast",
            JobKind::Setup => "Setup",
            JobKind::CafPhase => "CafPhase",
            JobKind::CafWrapper => "CafWrapper",
            JobKind::BarRecursion => "BarRecursion",
            JobKind::BarWrapper => "BarWrapper",
            JobKind::BarWrapperLarge => "BarWrapperLarge",
            JobKind::BarEndAligner => "BarEndAligner",
            JobKind::BarWithPrecomputed => "BarWithPrecomputed",
            JobKind::NormalRecursion => "NormalRecursion",
            JobKind::NormalWrapper => "NormalWrapper",
            JobKind::AvgRecursion => "AvgRecursion",
            JobKind::AvgWrapper => "AvgWrapper",
            JobKind::ReferenceRecursion => "ReferenceRecursion",
            JobKind::ReferenceWrapper => "ReferenceWrapper",
            JobKind::CoordinatesUp => "CoordinatesUp",
            JobKind::CoordinatesDownRecursion => "CoordinatesDownRecursion",
            JobKind::CoordinatesDown => "CoordinatesDown",
            JobKind::ExtractReference => "ExtractReference",
            JobKind::CheckRecursion => "CheckRecursion",
            JobKind::CheckWrapper => "CheckWrapper",
            JobKind::FastaGenerator => "FastaGenerator",
            JobKind::HalRecursion => "HalRecursion",
            JobKind::HalUpWrapper => "HalUpWrapper",
            JobKind::PrimaryStore => "PrimaryStore",
            JobKind::SecondaryStore => "SecondaryStore",
        }
    }

    pub fn from_name(name: &str) -> Option<JobKind> {
        Self::ALL.iter().find(|k| k.name() == name).copied()
    }

    /// External program run by this job. Recursion and store jobs run none.
    pub fn program(&self) -> Option<&'static str> {
        match self {
            JobKind::Blast => Some("blast"),
            JobKind::Setup => Some("setup"),
            JobKind::CafPhase => Some("caf-prepare"),
            JobKind::CafWrapper => Some("caf"),
            JobKind::BarWrapper => Some("bar"),
            JobKind::BarWrapperLarge => Some("bar-diagnose"),
            JobKind::BarEndAligner => Some("bar-end-aligner"),
            JobKind::BarWithPrecomputed => Some("bar-precomputed"),
            JobKind::NormalWrapper => Some("normalise"),
            JobKind::AvgWrapper => Some("avg"),
            JobKind::ReferenceWrapper => Some("reference"),
            JobKind::CoordinatesUp => Some("coords-up"),
            JobKind::CoordinatesDown => Some("coords-down"),
            JobKind::ExtractReference => Some("extract-reference"),
            JobKind::CheckWrapper => Some("check"),
            JobKind::FastaGenerator => Some("fasta"),
            JobKind::HalUpWrapper => Some("hal-up"),
            JobKind::BarRecursion
            | JobKind::NormalRecursion
            | JobKind::AvgRecursion
            | JobKind::ReferenceRecursion
            | JobKind::CoordinatesDownRecursion
            | JobKind::CheckRecursion
            | JobKind::HalRecursion
            | JobKind::PrimaryStore
            | JobKind::SecondaryStore => None,
        }
    }

    /// The phase whose bag supplies phase-level defaults for this job.
    pub fn phase(&self) -> PhaseName {
        match self {
            JobKind::Blast => PhaseName::TrimBlast,
            JobKind::Setup | JobKind::PrimaryStore => PhaseName::Setup,
            JobKind::CafPhase | JobKind::CafWrapper => PhaseName::Caf,
            JobKind::BarRecursion
            | JobKind::BarWrapper
            | JobKind::BarWrapperLarge
            | JobKind::BarEndAligner
            | JobKind::BarWithPrecomputed => PhaseName::Bar,
            JobKind::NormalRecursion | JobKind::NormalWrapper => PhaseName::Normal,
            JobKind::AvgRecursion | JobKind::AvgWrapper => PhaseName::Avg,
            JobKind::ReferenceRecursion
            | JobKind::ReferenceWrapper
            | JobKind::CoordinatesUp
            | JobKind::CoordinatesDownRecursion
            | JobKind::CoordinatesDown
            | JobKind::ExtractReference
            | JobKind::SecondaryStore => PhaseName::Reference,
            JobKind::CheckRecursion | JobKind::CheckWrapper => PhaseName::Check,
            JobKind::FastaGenerator | JobKind::HalRecursion | JobKind::HalUpWrapper => {
                PhaseName::Hal
            }
        }
    }

    /// Long alignment tasks are expensive to restart.
    pub fn preemptable(&self) -> bool {
        !matches!(
            self,
            JobKind::Blast
                | JobKind::CafWrapper
                | JobKind::BarWrapper
                | JobKind::BarWrapperLarge
                | JobKind::BarWithPrecomputed
                | JobKind::PrimaryStore
                | JobKind::SecondaryStore
        )
    }

    pub fn is_recursion(&self) -> bool {
        matches!(
            self,
            JobKind::BarRecursion
                | JobKind::NormalRecursion
                | JobKind::AvgRecursion
                | JobKind::ReferenceRecursion
                | JobKind::CoordinatesDownRecursion
                | JobKind::CheckRecursion
                | JobKind::HalRecursion
        )
    }

    /// Fitted memory model, coefficients in ascending degree.
    pub fn builtin_memory_model(&self) -> Option<ResourcePolynomial> {
        let model = |coefficients: &[f64], feature: Feature| {
            ResourcePolynomial::new(self.name(), coefficients.to_vec(), feature).ok()
        };
        match self {
            JobKind::CafPhase => model(&[4.49616219e8, 2.51087392], Feature::TotalInputSize),
            JobKind::CafWrapper => model(&[7.96042247e7, 18.0395944], Feature::TotalInputSize)
                .map(|m| m.with_cap(120e9)),
            JobKind::BarWrapper => model(&[2.96245523e9, 0.281473430], Feature::GroupSize),
            JobKind::BarWrapperLarge => Some(ResourcePolynomial::constant(3e9)),
            JobKind::BarEndAligner => model(&[4.87e9, 1.495e-3], Feature::MaxSubItemSize)
                .map(|m| m.with_cap(40e9)),
            JobKind::BarWithPrecomputed => {
                model(&[3.29659639e8, 1.99700749], Feature::PrecomputedSize)
            }
            JobKind::ReferenceWrapper => {
                model(&[141266641.0, 0.717091106851297], Feature::MaxUnitSize)
            }
            JobKind::CoordinatesUp => {
                model(&[180741939.947, 1.30307429247443], Feature::MaxUnitSize)
            }
            JobKind::CoordinatesDown => {
                model(&[116287385.0, 0.528440153969149], Feature::MaxUnitSize)
            }
            JobKind::ExtractReference => model(&[4.70479486e8, 2.24519561], Feature::TotalInputSize),
            JobKind::FastaGenerator => model(&[4.48507512e8, 2.99160856], Feature::TotalInputSize),
            JobKind::HalUpWrapper => Some(ResourcePolynomial::constant(4e9)),
            JobKind::PrimaryStore | JobKind::SecondaryStore => {
                model(&[2.01324291e8, 4.10201882], Feature::TotalInputSize)
                    .map(|m| m.with_floor(2.5e9))
            }
            JobKind::BarRecursion
            | JobKind::ReferenceRecursion
            | JobKind::CoordinatesDownRecursion
            | JobKind::HalRecursion => Some(ResourcePolynomial::constant(2e9)),
            JobKind::Blast
            | JobKind::Setup
            | JobKind::NormalRecursion
            | JobKind::NormalWrapper
            | JobKind::AvgRecursion
            | JobKind::AvgWrapper
            | JobKind::CheckRecursion
            | JobKind::CheckWrapper => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
