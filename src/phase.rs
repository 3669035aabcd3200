//! Pipeline phases and the checkpoint groups that bracket them.
//!
//! This module provides:
//! - `PhaseName`, the fixed ordered phase sequence
//! - `PhaseSpec` with its recursion gate and grouping tunables
//! - `CheckpointGroup`, the phase runs that share one live store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::attributes::{AttributeBag, AttributeSource, resolve};
use crate::errors::ConfigError;

/// One step of the fixed phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    TrimBlast,
    Setup,
    Caf,
    Bar,
    Normal,
    Avg,
    Reference,
    Check,
    Hal,
}

impl PhaseName {
    pub const SEQUENCE: [PhaseName; 9] = [
        PhaseName::TrimBlast,
        PhaseName::Setup,
        PhaseName::Caf,
        PhaseName::Bar,
        PhaseName::Normal,
        PhaseName::Avg,
        PhaseName::Reference,
        PhaseName::Check,
        PhaseName::Hal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::TrimBlast => "trim_blast",
            PhaseName::Setup => "setup",
            PhaseName::Caf => "caf",
            PhaseName::Bar => "bar",
            PhaseName::Normal => "normal",
            PhaseName::Avg => "avg",
            PhaseName::Reference => "reference",
            PhaseName::Check => "check",
            PhaseName::Hal => "hal",
        }
    }

    /// Zero-based position in the sequence.
    pub fn position(&self) -> usize {
        Self::SEQUENCE
            .iter()
            .position(|p| p == self)
            .unwrap_or_default()
    }

    pub fn next(&self) -> Option<PhaseName> {
        Self::SEQUENCE.get(self.position() + 1).copied()
    }

    /// The boolean attribute that opts this phase into its work.
    ///
    /// `normal` is gated by its iteration count instead; the always-on
    /// preparation phases have no gate.
    pub fn gate_key(&self) -> Option<&'static str> {
        match self {
            PhaseName::Bar => Some("run_bar"),
            PhaseName::Avg => Some("build_avgs"),
            PhaseName::Reference => Some("build_reference"),
            PhaseName::Check => Some("run_check"),
            PhaseName::Hal => Some("build_hal"),
            PhaseName::TrimBlast | PhaseName::Setup | PhaseName::Caf | PhaseName::Normal => None,
        }
    }

    pub fn is_iterative(&self) -> bool {
        matches!(self, PhaseName::Normal)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::SEQUENCE
            .iter()
            .find(|p| p.as_str().replace('_', "") == normalized)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPhase(s.to_string()))
    }
}

pub const DEFAULT_MAX_GROUP_SIZE: u64 = 1_000_000;
pub const DEFAULT_VERY_LARGE_SIZE: u64 = 1_000_000;

/// Grouping and iteration tunables of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTunables {
    pub min_unit_size: u64,
    pub max_group_size: u64,
    pub max_secondary_group_size: u64,
    pub very_large_size: u64,
    pub iterations: u32,
}

impl Default for PhaseTunables {
    fn default() -> Self {
        Self {
            min_unit_size: 0,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            max_secondary_group_size: DEFAULT_MAX_GROUP_SIZE,
            very_large_size: DEFAULT_VERY_LARGE_SIZE,
            iterations: 0,
        }
    }
}

/// A phase as configured: its position, recursion gate and tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub position: usize,
    pub recurses: bool,
    pub tunables: PhaseTunables,
}

impl PhaseSpec {
    /// Read a phase from its attribute bag.
    ///
    /// Gated phases default to off. `normal` recurses while its iteration
    /// count is positive.
    pub fn from_bag(name: PhaseName, bag: &AttributeBag) -> Result<Self, ConfigError> {
        let location = format!("phases.{}", name);
        let source = AttributeSource::new(&location, bag);
        let defaults = PhaseTunables::default();

        let tunables = PhaseTunables {
            min_unit_size: resolve(&[(source, "min_unit_size")], defaults.min_unit_size)?,
            max_group_size: resolve(&[(source, "max_group_size")], defaults.max_group_size)?,
            max_secondary_group_size: resolve(
                &[(source, "max_secondary_group_size")],
                defaults.max_secondary_group_size,
            )?,
            very_large_size: resolve(&[(source, "very_large_size")], defaults.very_large_size)?,
            iterations: resolve(&[(source, "iterations")], defaults.iterations)?,
        };

        let recurses = match name.gate_key() {
            Some(key) => resolve(&[(source, key)], false)?,
            None if name.is_iterative() => tunables.iterations > 0,
            None => true,
        };

        Ok(Self {
            name,
            position: name.position(),
            recurses,
            tunables,
        })
    }
}

/// A run of consecutive phases executed against one live primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointGroup {
    Setup,
    Bar,
    Reference,
    Hal,
}

impl CheckpointGroup {
    pub const ALL: [CheckpointGroup; 4] = [
        CheckpointGroup::Setup,
        CheckpointGroup::Bar,
        CheckpointGroup::Reference,
        CheckpointGroup::Hal,
    ];

    pub fn phases(&self) -> &'static [PhaseName] {
        match self {
            CheckpointGroup::Setup => &[PhaseName::Setup, PhaseName::Caf],
            CheckpointGroup::Bar => &[PhaseName::Bar, PhaseName::Normal, PhaseName::Avg],
            CheckpointGroup::Reference => &[PhaseName::Reference, PhaseName::Check],
            CheckpointGroup::Hal => &[PhaseName::Hal],
        }
    }

    /// Dump label: the name of the last phase in the group.
    pub fn label(&self) -> &'static str {
        self.phases()
            .last()
            .map(PhaseName::as_str)
            .unwrap_or("checkpoint")
    }

    pub fn first_phase(&self) -> PhaseName {
        self.phases()[0]
    }

    pub fn contains(&self, phase: PhaseName) -> bool {
        self.phases().contains(&phase)
    }

    pub fn for_phase(phase: PhaseName) -> Option<CheckpointGroup> {
        Self::ALL.iter().find(|g| g.contains(phase)).copied()
    }

    pub fn from_label(label: &str) -> Option<CheckpointGroup> {
        Self::ALL.iter().find(|g| g.label() == label).copied()
    }

    pub fn next(&self) -> Option<CheckpointGroup> {
        let index = Self::ALL.iter().position(|g| g == self)?;
        Self::ALL.get(index + 1).copied()
    }
}

impl fmt::Display for CheckpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order() {
        let names: Vec<&str> = PhaseName::SEQUENCE.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "trim_blast",
                "setup",
                "caf",
                "bar",
                "normal",
                "avg",
                "reference",
                "check",
                "hal"
            ]
        );
        assert_eq!(PhaseName::TrimBlast.next(), Some(PhaseName::Setup));
        assert_eq!(PhaseName::Normal.next(), Some(PhaseName::Avg));
        assert_eq!(PhaseName::Hal.next(), None);
    }

    #[test]
    fn test_phase_name_parsing_accepts_camel_case() {
        assert_eq!("trimBlast".parse::<PhaseName>().unwrap(), PhaseName::TrimBlast);
        assert_eq!("trim_blast".parse::<PhaseName>().unwrap(), PhaseName::TrimBlast);
        assert_eq!("HAL".parse::<PhaseName>().unwrap(), PhaseName::Hal);
        assert!("blast".parse::<PhaseName>().is_err());
    }

    #[test]
    fn test_phase_spec_gate_defaults_off() {
        let spec = PhaseSpec::from_bag(PhaseName::Bar, &AttributeBag::new()).unwrap();
        assert!(!spec.recurses);
        assert_eq!(spec.position, 3);
        assert_eq!(spec.tunables, PhaseTunables::default());
    }

    #[test]
    fn test_phase_spec_reads_tunables() {
        let bag = AttributeBag::new()
            .with("run_bar", "1")
            .with("max_group_size", 200)
            .with("min_unit_size", 20);
        let spec = PhaseSpec::from_bag(PhaseName::Bar, &bag).unwrap();
        assert!(spec.recurses);
        assert_eq!(spec.tunables.max_group_size, 200);
        assert_eq!(spec.tunables.min_unit_size, 20);
    }

    #[test]
    fn test_normal_recurses_only_with_iterations() {
        let off = PhaseSpec::from_bag(PhaseName::Normal, &AttributeBag::new()).unwrap();
        assert!(!off.recurses);
        let on = PhaseSpec::from_bag(PhaseName::Normal, &AttributeBag::new().with("iterations", 2))
            .unwrap();
        assert!(on.recurses);
        assert_eq!(on.tunables.iterations, 2);
    }

    #[test]
    fn test_checkpoint_groups_cover_store_phases_in_order() {
        let covered: Vec<PhaseName> = CheckpointGroup::ALL
            .iter()
            .flat_map(|g| g.phases().iter().copied())
            .collect();
        assert_eq!(covered, PhaseName::SEQUENCE[1..].to_vec());
        assert_eq!(CheckpointGroup::Setup.label(), "caf");
        assert_eq!(CheckpointGroup::Bar.label(), "avg");
        assert_eq!(CheckpointGroup::Reference.label(), "check");
        assert_eq!(CheckpointGroup::from_label("avg"), Some(CheckpointGroup::Bar));
        assert_eq!(CheckpointGroup::Bar.next(), Some(CheckpointGroup::Reference));
        assert_eq!(CheckpointGroup::Hal.next(), None);
        assert_eq!(CheckpointGroup::for_phase(PhaseName::TrimBlast), None);
    }
}
