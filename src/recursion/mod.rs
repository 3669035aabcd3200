//! Work-tree decomposition.
//!
//! - `grouping`: bounded dispatch groups, oversize isolation, secondary splits
//! - `extending`: batching of diagnostic sub-items for precomputation

pub mod extending;
pub mod grouping;

pub use extending::{ExtendingBatcher, ExtendingDispatch, SubItem, plan_extension};
pub use grouping::{
    DispatchGroup, GroupingThresholds, decompose, secondary_layout, split_secondary,
};
