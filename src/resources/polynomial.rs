//! Polynomial memory models over a scalar input-size feature.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ResourceEstimationError;
use crate::units::WorkUnit;

/// The scalar metric a memory model is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Sum of unit sizes in the dispatched group.
    GroupSize,
    /// Largest single unit in the group.
    MaxUnitSize,
    UnitCount,
    /// Total size of the pipeline input.
    TotalInputSize,
    /// Sum of precomputed partial-result artifact sizes.
    PrecomputedSize,
    SubItemGroupSize,
    MaxSubItemSize,
    SubItemCount,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::GroupSize,
        Feature::MaxUnitSize,
        Feature::UnitCount,
        Feature::TotalInputSize,
        Feature::PrecomputedSize,
        Feature::SubItemGroupSize,
        Feature::MaxSubItemSize,
        Feature::SubItemCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::GroupSize => "group_size",
            Feature::MaxUnitSize => "max_unit_size",
            Feature::UnitCount => "unit_count",
            Feature::TotalInputSize => "total_input_size",
            Feature::PrecomputedSize => "precomputed_size",
            Feature::SubItemGroupSize => "sub_item_group_size",
            Feature::MaxSubItemSize => "max_sub_item_size",
            Feature::SubItemCount => "sub_item_count",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ResourceEstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or_else(|| ResourceEstimationError::UnknownFeature {
                name: s.to_string(),
            })
    }
}

/// Feature values computed for one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    values: BTreeMap<Feature, f64>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group-derived features plus the pipeline total.
    pub fn for_units(units: &[WorkUnit], total_input_size: u64) -> Self {
        let group: u64 = units.iter().map(|u| u.size).sum();
        let max = units.iter().map(|u| u.size).max().unwrap_or(0);
        Self::new()
            .with(Feature::GroupSize, group as f64)
            .with(Feature::MaxUnitSize, max as f64)
            .with(Feature::UnitCount, units.len() as f64)
            .with(Feature::TotalInputSize, total_input_size as f64)
    }

    pub fn with(mut self, feature: Feature, value: f64) -> Self {
        self.values.insert(feature, value);
        self
    }

    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.values.get(&feature).copied()
    }
}

/// `memory = Σ cᵢ·xⁱ`, coefficients in ascending degree, then capped and floored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolynomial {
    coefficients: Vec<f64>,
    feature: Feature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    floor: Option<f64>,
}

impl ResourcePolynomial {
    /// Build a model, rejecting empty or non-finite coefficient lists.
    pub fn new(
        job: &str,
        coefficients: Vec<f64>,
        feature: Feature,
    ) -> Result<Self, ResourceEstimationError> {
        if coefficients.is_empty() {
            return Err(ResourceEstimationError::EmptyPolynomial {
                job: job.to_string(),
            });
        }
        if let Some(index) = coefficients.iter().position(|c| !c.is_finite()) {
            return Err(ResourceEstimationError::NonFiniteCoefficient {
                job: job.to_string(),
                index,
            });
        }
        Ok(Self {
            coefficients,
            feature,
            cap: None,
            floor: None,
        })
    }

    /// A degree-zero model.
    pub fn constant(value: f64) -> Self {
        Self {
            coefficients: vec![value],
            feature: Feature::GroupSize,
            cap: None,
            floor: None,
        }
    }

    pub fn with_cap(mut self, cap: f64) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    pub fn cap(&self) -> Option<f64> {
        self.cap
    }

    pub fn floor(&self) -> Option<f64> {
        self.floor
    }

    /// Carry the cap and floor of `other` onto this model.
    pub fn with_limits_of(mut self, other: &ResourcePolynomial) -> Self {
        self.cap = other.cap;
        self.floor = other.floor;
        self
    }

    pub fn is_constant(&self) -> bool {
        self.coefficients.len() == 1
    }

    /// Evaluate at `x` with cap and floor applied.
    pub fn evaluate(&self, x: f64) -> f64 {
        let raw = self
            .coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * x + c);
        let capped = match self.cap {
            Some(cap) if raw > cap => cap,
            _ => raw,
        };
        match self.floor {
            Some(floor) if capped < floor => floor,
            _ => capped,
        }
    }

    /// Estimate bytes for a dispatch. Constant models ignore the feature set.
    pub fn estimate(&self, job: &str, features: &FeatureSet) -> Result<u64, ResourceEstimationError> {
        let x = if self.is_constant() {
            0.0
        } else {
            features
                .get(self.feature)
                .ok_or_else(|| ResourceEstimationError::UnresolvedFeature {
                    feature: self.feature.to_string(),
                })?
        };
        let value = self.evaluate(x);
        if !value.is_finite() || value < 0.0 {
            return Err(ResourceEstimationError::NonFiniteEstimate {
                job: job.to_string(),
            });
        }
        Ok(value as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_model_with_cap() {
        let poly = ResourcePolynomial::new("X", vec![10.0, 2.0], Feature::GroupSize)
            .unwrap()
            .with_cap(100.0);
        assert_eq!(poly.evaluate(5.0), 20.0);
        assert_eq!(poly.evaluate(45.0), 100.0);
        assert_eq!(poly.evaluate(1000.0), 100.0);
    }

    #[test]
    fn test_constant_model_ignores_feature() {
        let poly = ResourcePolynomial::constant(2.5e9);
        let empty = FeatureSet::new();
        assert_eq!(poly.estimate("X", &empty).unwrap(), 2_500_000_000);
        let big = FeatureSet::new().with(Feature::GroupSize, 1e12);
        assert_eq!(poly.estimate("X", &big).unwrap(), 2_500_000_000);
    }

    #[test]
    fn test_quadratic_ascending_order() {
        let poly = ResourcePolynomial::new("X", vec![1.0, 0.0, 3.0], Feature::MaxUnitSize).unwrap();
        assert_eq!(poly.evaluate(2.0), 13.0);
    }

    #[test]
    fn test_floor_applies_after_cap() {
        let poly = ResourcePolynomial::new("Store", vec![2.01324291e8, 4.10201882], Feature::TotalInputSize)
            .unwrap()
            .with_floor(2.5e9);
        let small = FeatureSet::new().with(Feature::TotalInputSize, 1000.0);
        assert_eq!(poly.estimate("Store", &small).unwrap(), 2_500_000_000);
        let large = FeatureSet::new().with(Feature::TotalInputSize, 1e9);
        assert!(poly.estimate("Store", &large).unwrap() > 4_000_000_000);
    }

    #[test]
    fn test_rejects_malformed_polynomials() {
        assert!(matches!(
            ResourcePolynomial::new("X", vec![], Feature::GroupSize),
            Err(ResourceEstimationError::EmptyPolynomial { .. })
        ));
        assert!(matches!(
            ResourcePolynomial::new("X", vec![1.0, f64::NAN], Feature::GroupSize),
            Err(ResourceEstimationError::NonFiniteCoefficient { index: 1, .. })
        ));
    }

    #[test]
    fn test_missing_feature_is_unresolved() {
        let poly = ResourcePolynomial::new("X", vec![1.0, 1.0], Feature::PrecomputedSize).unwrap();
        let err = poly.estimate("X", &FeatureSet::new()).unwrap_err();
        assert!(matches!(err, ResourceEstimationError::UnresolvedFeature { .. }));
    }

    #[test]
    fn test_feature_names_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert!("flowerGroupSize".parse::<Feature>().is_err());
    }

    #[test]
    fn test_features_for_units() {
        let units = [WorkUnit::new(1, 100), WorkUnit::new(2, 50)];
        let features = FeatureSet::for_units(&units, 1000);
        assert_eq!(features.get(Feature::GroupSize), Some(150.0));
        assert_eq!(features.get(Feature::MaxUnitSize), Some(100.0));
        assert_eq!(features.get(Feature::UnitCount), Some(2.0));
        assert_eq!(features.get(Feature::TotalInputSize), Some(1000.0));
    }
}
