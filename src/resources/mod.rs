//! Resource prediction for dispatched tasks.
//!
//! - `polynomial`: fitted memory models evaluated at an input-size feature
//! - `predictor`: model lookup plus the job → phase → constants default chains

pub mod polynomial;
pub mod predictor;

pub use polynomial::{Feature, FeatureSet, ResourcePolynomial};
pub use predictor::{ResourcePredictor, ResourceRequest};
