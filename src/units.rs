//! Work units and their compact name encoding.
//!
//! A unit set travels to external programs as a single string:
//! `"<count> <first id> <delta> <delta> ..."`, each id after the first
//! written as the difference to its predecessor.

use serde::{Deserialize, Serialize};

use crate::errors::DecompositionError;

pub type UnitId = u64;

/// The id of the work-tree root.
pub const ROOT_UNIT: UnitId = 0;

/// A node of the work tree with its size metric in bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub size: u64,
}

impl WorkUnit {
    pub fn new(id: UnitId, size: u64) -> Self {
        Self { id, size }
    }
}

/// Encode unit ids in order. Ids may decrease; deltas are signed.
pub fn encode_unit_names(ids: impl IntoIterator<Item = UnitId>) -> String {
    let ids: Vec<UnitId> = ids.into_iter().collect();
    let mut out = ids.len().to_string();
    let mut previous: i128 = 0;
    for id in ids {
        let current = id as i128;
        out.push(' ');
        out.push_str(&(current - previous).to_string());
        previous = current;
    }
    out
}

pub fn decode_unit_names(encoded: &str) -> Result<Vec<UnitId>, DecompositionError> {
    let mut tokens = encoded.split_whitespace();
    let count: usize = tokens
        .next()
        .ok_or_else(|| DecompositionError::MalformedUnitNames("empty".to_string()))?
        .parse()
        .map_err(|_| DecompositionError::MalformedUnitNames(encoded.to_string()))?;

    let mut ids = Vec::with_capacity(count);
    let mut previous: i128 = 0;
    for token in tokens {
        let delta: i128 = token
            .parse()
            .map_err(|_| DecompositionError::MalformedUnitNames(encoded.to_string()))?;
        let current = previous + delta;
        let id = UnitId::try_from(current)
            .map_err(|_| DecompositionError::MalformedUnitNames(encoded.to_string()))?;
        ids.push(id);
        previous = current;
    }

    if ids.len() != count {
        return Err(DecompositionError::UnitCountMismatch {
            expected: count,
            consumed: ids.len(),
        });
    }
    Ok(ids)
}

pub fn total_size(units: &[WorkUnit]) -> u64 {
    units.iter().map(|u| u.size).sum()
}

pub fn max_size(units: &[WorkUnit]) -> u64 {
    units.iter().map(|u| u.size).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_delta_names() {
        assert_eq!(encode_unit_names([3, 5, 9]), "3 3 2 4");
        assert_eq!(encode_unit_names([]), "0");
    }

    #[test]
    fn test_encode_handles_decreasing_ids() {
        let encoded = encode_unit_names([10, 4]);
        assert_eq!(encoded, "2 10 -6");
        assert_eq!(decode_unit_names(&encoded).unwrap(), vec![10, 4]);
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let err = decode_unit_names("3 1 1").unwrap_err();
        assert!(matches!(
            err,
            DecompositionError::UnitCountMismatch {
                expected: 3,
                consumed: 2
            }
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_unit_names("").is_err());
        assert!(decode_unit_names("two 1 2").is_err());
        assert!(decode_unit_names("1 -5").is_err());
    }

    #[test]
    fn test_sizes() {
        let units = [WorkUnit::new(1, 100), WorkUnit::new(2, 50)];
        assert_eq!(total_size(&units), 150);
        assert_eq!(max_size(&units), 100);
        assert_eq!(max_size(&[]), 0);
    }
}
