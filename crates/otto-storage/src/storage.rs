//! Storage traits: the experiment scope and its transactional trial API.

use async_trait::async_trait;

use otto_core::{ParamDict, Result, Status};
use otto_tunables::TunableGroups;

use crate::trial::TrialRecord;

/// Identity and compatibility fingerprint of an experiment.
#[derive(Debug, Clone)]
pub struct ExperimentSpec {
    pub experiment_id: String,
    /// Hash of the root environment descriptor.
    pub root_env_hash: String,
    /// Name of the optimization target metric.
    pub opt_target: String,
    /// Hash of the tunable parameter space.
    pub param_space_hash: String,
    pub description: Option<String>,
    /// Extra experiment ids whose observations are merged into `load()`.
    pub merge_experiments: Vec<String>,
}

impl ExperimentSpec {
    pub fn new(experiment_id: &str, root_env_hash: &str, opt_target: &str) -> Self {
        ExperimentSpec {
            experiment_id: experiment_id.to_string(),
            root_env_hash: root_env_hash.to_string(),
            opt_target: opt_target.to_string(),
            param_space_hash: String::new(),
            description: None,
            merge_experiments: Vec::new(),
        }
    }

    pub fn with_param_space(mut self, tunables: &TunableGroups) -> Self {
        self.param_space_hash = tunables.space_hash();
        self
    }
}

/// A storage backend capable of opening experiment scopes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open (or resume) an experiment scope. Opening verifies compatibility
    /// with prior runs under the same id and fails with `ExperimentMismatch`
    /// on a different parameter space, target, or root environment.
    async fn experiment(&self, spec: ExperimentSpec) -> Result<Box<dyn ExperimentScope>>;
}

/// Transactional boundary for one experiment. Trial writes are serialized
/// and observable in allocation order.
#[async_trait]
pub trait ExperimentScope: Send {
    fn experiment_id(&self) -> &str;

    /// All terminal observations of this experiment plus any merged-in ones:
    /// `(configs, scores, statuses)` with scores present for succeeded rows.
    async fn load(&self) -> Result<(Vec<ParamDict>, Vec<Option<f64>>, Vec<Status>)>;

    /// Trials created but never terminally updated, in allocation order.
    async fn pending_trials(&self) -> Result<Vec<TrialRecord>>;

    /// Allocate a new trial with a frozen snapshot of the tunables.
    async fn new_trial(&mut self, tunables: &TunableGroups) -> Result<TrialRecord>;

    /// Atomically transition a trial and record its results.
    async fn update_trial(
        &mut self,
        trial_id: u64,
        status: Status,
        results: Option<&ParamDict>,
    ) -> Result<()>;

    /// Record an intermediate telemetry snapshot without a state transition.
    async fn update_telemetry(
        &mut self,
        trial_id: u64,
        status: Status,
        telemetry: Option<&ParamDict>,
    ) -> Result<()>;
}
