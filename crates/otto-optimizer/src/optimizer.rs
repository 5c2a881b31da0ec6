//! The interface between the experiment driver and the optimization engines.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use otto_core::{Error, ParamDict, ParamValue, Result, Status};
use otto_tunables::TunableGroups;

/// Direction of the optimization target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationDirection {
    Minimize,
    Maximize,
}

impl OptimizationDirection {
    /// Sign applied to raw scores so the engines always minimize.
    pub fn sign(self) -> f64 {
        match self {
            OptimizationDirection::Minimize => 1.0,
            OptimizationDirection::Maximize => -1.0,
        }
    }
}

/// Declarative optimizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Iteration budget for the base convergence criterion.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Metric to minimize; mutually exclusive with `maximize`.
    #[serde(default)]
    pub minimize: Option<String>,
    /// Metric to maximize; mutually exclusive with `minimize`.
    #[serde(default)]
    pub maximize: Option<String>,
    /// Seed for stochastic engines.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl OptimizerConfig {
    pub const DEFAULT_MAX_ITERATIONS: u64 = 100;
    pub const DEFAULT_TARGET: &'static str = "score";

    /// Resolve the optimization target; specifying both directions is a
    /// configuration error, none defaults to minimizing `score`.
    pub fn target(&self) -> Result<(String, OptimizationDirection)> {
        match (&self.minimize, &self.maximize) {
            (Some(_), Some(_)) => Err(Error::config(
                "exactly one of minimize/maximize may be specified",
            )),
            (Some(metric), None) => Ok((metric.clone(), OptimizationDirection::Minimize)),
            (None, Some(metric)) => Ok((metric.clone(), OptimizationDirection::Maximize)),
            (None, None) => Ok((
                Self::DEFAULT_TARGET.to_string(),
                OptimizationDirection::Minimize,
            )),
        }
    }
}

/// Why an optimizer could not produce a suggestion.
#[derive(Debug, Error)]
pub enum SuggestError {
    #[error("configuration space is exhausted")]
    SpaceExhausted,
    #[error("surrogate model is not fitted yet")]
    ModelNotFitted,
    #[error("optimizer failure: {reason}")]
    Internal { reason: String },
}

/// An optimizer proposes tunable assignments and learns from trial outcomes.
pub trait Optimizer: Send + Sync {
    /// Name of the metric being optimized.
    fn target(&self) -> &str;

    fn direction(&self) -> OptimizationDirection;

    /// Load historical observations; returns whether any rows were accepted.
    /// Rows with a non-succeeded status do not contribute scores but still
    /// count toward iteration accounting.
    fn bulk_register(
        &mut self,
        configs: &[ParamDict],
        scores: &[Option<f64>],
        statuses: Option<&[Status]>,
    ) -> Result<bool>;

    /// Next configuration to benchmark: a copy of the configuration space
    /// with every tunable assigned. Successive calls may repeat themselves.
    fn suggest(&mut self) -> std::result::Result<TunableGroups, SuggestError>;

    /// Register one observation; `score` must be present iff the status is
    /// succeeded. Returns the signed score used for modeling (negated when
    /// maximizing).
    fn register(
        &mut self,
        tunables: &TunableGroups,
        status: Status,
        score: Option<&ParamDict>,
    ) -> Result<Option<f64>>;

    /// Best observation so far: both fields present or none at all.
    fn best_observation(&self) -> Option<(f64, TunableGroups)>;

    /// True while the iteration budget is not exhausted.
    fn not_converged(&self) -> bool;
}

/// Bookkeeping shared by all optimizer implementations: the configuration
/// space, the target metric, and iteration accounting.
#[derive(Debug, Clone)]
pub struct OptimizerCore {
    tunables: TunableGroups,
    target: String,
    direction: OptimizationDirection,
    max_iterations: u64,
    iteration: u64,
}

impl OptimizerCore {
    pub fn new(tunables: TunableGroups, config: &OptimizerConfig) -> Result<Self> {
        let (target, direction) = config.target()?;
        info!(%target, ?direction, "create optimizer");
        Ok(OptimizerCore {
            tunables,
            target,
            direction,
            max_iterations: config
                .max_iterations
                .unwrap_or(OptimizerConfig::DEFAULT_MAX_ITERATIONS),
            iteration: 1,
        })
    }

    pub fn tunables(&self) -> &TunableGroups {
        &self.tunables
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn direction(&self) -> OptimizationDirection {
        self.direction
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn advance(&mut self) {
        self.iteration += 1;
    }

    pub fn not_converged(&self) -> bool {
        self.iteration <= self.max_iterations
    }

    /// Enforce the status/score consistency rule and extract the signed
    /// scalar used for modeling.
    pub fn signed_score(
        &self,
        status: Status,
        score: Option<&ParamDict>,
    ) -> Result<Option<f64>> {
        if status.is_succeeded() == score.is_none() {
            return Err(Error::InconsistentObservation { status });
        }
        if !status.is_succeeded() {
            return Ok(None);
        }
        let row = score.ok_or(Error::InconsistentObservation { status })?;
        let raw = row
            .get(&self.target)
            .and_then(ParamValue::as_f64)
            .ok_or(Error::InconsistentObservation { status })?;
        Ok(Some(raw * self.direction.sign()))
    }
}
