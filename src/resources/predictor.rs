//! Per-dispatch memory and CPU prediction.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::polynomial::{Feature, ResourcePolynomial};
use crate::config::{AttributeSource, PipelineConfig, resolve, resolve_optional};
use crate::errors::ResourceEstimationError;
use crate::jobs::{JobKind, ResourceEstimable};

/// Resources declared for one submitted task. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub memory: Option<u64>,
    pub cpu: Option<f64>,
    pub preemptable: bool,
    pub checkpoint: bool,
}

impl ResourceRequest {
    pub fn describe_memory(&self) -> String {
        match self.memory {
            Some(bytes) => format!("{:.2}G", bytes as f64 / 1e9),
            None => "unbounded".to_string(),
        }
    }
}

/// Attribute names of one default chain.
struct ChainKeys {
    job: &'static str,
    fallback: &'static str,
}

const MEMORY_KEYS: ChainKeys = ChainKeys {
    job: "memory",
    fallback: "default_memory",
};
const OVERLARGE_MEMORY_KEYS: ChainKeys = ChainKeys {
    job: "overlarge_memory",
    fallback: "default_overlarge_memory",
};
const CPU_KEYS: ChainKeys = ChainKeys {
    job: "cpu",
    fallback: "default_cpu",
};
const OVERLARGE_CPU_KEYS: ChainKeys = ChainKeys {
    job: "overlarge_cpu",
    fallback: "default_overlarge_cpu",
};

/// Predicts resources from config alone. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct ResourcePredictor {
    config: Arc<PipelineConfig>,
}

impl ResourcePredictor {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// The memory model for `kind`: job-bag overrides on top of the built-in fit.
    ///
    /// `memory_poly` replaces the coefficients; `memory_feature` and
    /// `memory_cap` adjust whichever model applies.
    pub fn memory_model(
        &self,
        kind: JobKind,
    ) -> Result<Option<ResourcePolynomial>, ResourceEstimationError> {
        let bag = self.config.job_bag(kind);
        let location = format!("jobs.{}", kind);
        let source = AttributeSource::new(&location, bag);

        let builtin = kind.builtin_memory_model();
        let feature = match resolve_optional::<String>(&[(source, "memory_feature")])? {
            Some(name) => Some(name.parse::<Feature>()?),
            None => None,
        };
        let cap = resolve_optional::<f64>(&[(source, "memory_cap")])?;

        let coefficients = resolve_optional::<Vec<f64>>(&[(source, "memory_poly")])?;
        let model = match (builtin, coefficients, feature) {
            (builtin, Some(coefficients), feature) => {
                let feature = feature
                    .or(builtin.as_ref().map(|m| m.feature()))
                    .unwrap_or(Feature::TotalInputSize);
                let model = ResourcePolynomial::new(kind.name(), coefficients, feature)?;
                Some(match &builtin {
                    Some(builtin) => model.with_limits_of(builtin),
                    None => model,
                })
            }
            (Some(builtin), None, Some(feature)) => Some(
                ResourcePolynomial::new(kind.name(), builtin.coefficients().to_vec(), feature)?
                    .with_limits_of(&builtin),
            ),
            (builtin, None, _) => builtin,
        };

        Ok(match (model, cap) {
            (Some(model), Some(cap)) => Some(model.with_cap(cap)),
            (model, _) => model,
        })
    }

    /// Predict the request for `job`. Errors surface at submission time.
    pub fn estimate(
        &self,
        job: &dyn ResourceEstimable,
        total_input_size: u64,
    ) -> Result<ResourceRequest, ResourceEstimationError> {
        let kind = job.kind();
        let oversize = job.oversize();

        let memory = match self.memory_model(kind)? {
            Some(model) => Some(model.estimate(kind.name(), &job.features(total_input_size))?),
            None => {
                let keys = if oversize {
                    &OVERLARGE_MEMORY_KEYS
                } else {
                    &MEMORY_KEYS
                };
                self.resolve_chain::<u64>(job, keys)?
            }
        };

        let cpu_keys = if oversize {
            &OVERLARGE_CPU_KEYS
        } else {
            &CPU_KEYS
        };
        let cpu = self.resolve_chain::<f64>(job, cpu_keys)?;

        let job_location = format!("jobs.{}", kind);
        let job_source = AttributeSource::new(&job_location, self.config.job_bag(kind));
        let preemptable = resolve(&[(job_source, "preemptable")], kind.preemptable())?;

        Ok(ResourceRequest {
            memory,
            cpu,
            preemptable,
            checkpoint: job.checkpoint(),
        })
    }

    /// job → phase → constants, `None` when nothing is configured.
    fn resolve_chain<T: crate::config::FromAttribute>(
        &self,
        job: &dyn ResourceEstimable,
        keys: &ChainKeys,
    ) -> Result<Option<T>, ResourceEstimationError> {
        let kind = job.kind();
        let phase = job.phase();
        let job_location = format!("jobs.{}", kind);
        let phase_location = format!("phases.{}", phase);
        let chain = [
            (
                AttributeSource::new(&job_location, self.config.job_bag(kind)),
                keys.job,
            ),
            (
                AttributeSource::new(&phase_location, self.config.phase_bag(phase)),
                keys.fallback,
            ),
            (
                AttributeSource::new("constants", &self.config.constants),
                keys.fallback,
            ),
        ];
        Ok(resolve_optional::<T>(&chain)?)
    }
}
