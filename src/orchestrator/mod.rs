//! Phase sequencing and the work-tree walk.
//!
//! - `controller`: the phase state machine and checkpoint groups
//! - `traversal`: per-phase recursion over the work tree
//! - `steps`: root-level steps such as blast preparation and exports
//! - `divergence`: species-tree distance and the blast identity filter

pub mod controller;
pub mod divergence;
pub mod steps;
pub mod traversal;

pub use controller::PhaseController;
pub use divergence::{identity_threshold, longest_path};
pub use steps::{RootSteps, prefix_unique_ids};
pub use traversal::RecursionEngine;
