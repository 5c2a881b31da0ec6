//! Experiment driver: sequences storage, optimizer and environment calls
//! with persistence checkpoints around every trial.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use otto_core::{parts_hash_hex, ParamDict, Result, Status};
use otto_env::Environment;
use otto_optimizer::Optimizer;
use otto_storage::{ExperimentScope, ExperimentSpec, Storage, TrialRecord};
use otto_tunables::TunableGroups;

/// Drives one experiment end to end.
///
/// All environment, optimizer and storage calls happen on one cooperative
/// task; the cancellation token propagates from here through the environment
/// and the service layer down to the remote-operation poller.
pub struct ExperimentDriver {
    experiment_id: String,
    global_config: ParamDict,
    merge_experiments: Vec<String>,
    teardown_on_exit: bool,
    cancel: CancellationToken,
}

impl ExperimentDriver {
    pub fn new(experiment_id: &str, global_config: ParamDict) -> Self {
        ExperimentDriver {
            experiment_id: experiment_id.to_string(),
            global_config,
            merge_experiments: Vec::new(),
            teardown_on_exit: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Merge observations from other experiments into the warm start.
    pub fn with_merge(mut self, experiment_ids: Vec<String>) -> Self {
        self.merge_experiments = experiment_ids;
        self
    }

    pub fn with_teardown(mut self, teardown_on_exit: bool) -> Self {
        self.teardown_on_exit = teardown_on_exit;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the optimization loop; returns the best observation, if any.
    ///
    /// Opens the experiment scope (verifying compatibility with prior runs),
    /// warm-starts the optimizer from stored observations, re-runs pending
    /// trials, then iterates suggest/run until convergence. The root
    /// environment is torn down on the way out.
    pub async fn optimize(
        &self,
        env: &mut dyn Environment,
        opt: &mut dyn Optimizer,
        storage: &dyn Storage,
    ) -> Result<Option<(f64, TunableGroups)>> {
        let spec = ExperimentSpec {
            experiment_id: self.experiment_id.clone(),
            root_env_hash: root_env_hash(env),
            opt_target: opt.target().to_string(),
            param_space_hash: env.tunable_params().space_hash(),
            description: None,
            merge_experiments: self.merge_experiments.clone(),
        };
        let mut scope = storage.experiment(spec).await?;
        info!(
            experiment = self.experiment_id,
            env = env.name(),
            target = opt.target(),
            "experiment scope open"
        );

        // Warm-start the optimizer from prior (and merged-in) observations.
        let (configs, scores, statuses) = scope.load().await?;
        if !configs.is_empty() {
            opt.bulk_register(&configs, &scores, Some(&statuses))?;
        }

        // First, complete any trials that never reached a terminal state.
        for trial in scope.pending_trials().await? {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(trial_id = trial.trial_id, "resume pending trial");
            self.run_trial(env, opt, scope.as_mut(), &trial).await?;
        }

        // Then run new trials until the optimizer is done.
        while opt.not_converged() && !self.cancel.is_cancelled() {
            let tunables = match opt.suggest() {
                Ok(tunables) => tunables,
                Err(err) => {
                    warn!(%err, "optimizer cannot produce a suggestion; stopping");
                    break;
                }
            };
            let trial = scope.new_trial(&tunables).await?;
            self.run_trial(env, opt, scope.as_mut(), &trial).await?;
        }

        if self.teardown_on_exit {
            env.teardown().await;
        }

        let best = opt.best_observation();
        match &best {
            Some((score, _)) => {
                info!(experiment = self.experiment_id, score = *score, "best observation");
            }
            None => warn!(experiment = self.experiment_id, "no successful trials"),
        }
        Ok(best)
    }

    /// Execute one trial: setup, telemetry checkpoint, run, persist,
    /// register. Teardown is deliberately NOT called here; it happens once
    /// at driver shutdown on the root environment.
    async fn run_trial(
        &self,
        env: &mut dyn Environment,
        opt: &mut dyn Optimizer,
        scope: &mut dyn ExperimentScope,
        trial: &TrialRecord,
    ) -> Result<()> {
        info!(trial_id = trial.trial_id, tunables = %trial.tunables, "trial start");
        if trial.status.is_pending() {
            scope
                .update_trial(trial.trial_id, Status::Running, None)
                .await?;
        }

        let trial_config = trial.config(&self.global_config);
        let is_ready = env.setup(&trial.tunables, &trial_config).await?;
        if self.cancel.is_cancelled() {
            scope
                .update_trial(trial.trial_id, Status::Canceled, None)
                .await?;
            opt.register(&trial.tunables, Status::Canceled, None)?;
            return Ok(());
        }
        if !is_ready {
            warn!(trial_id = trial.trial_id, env = env.name(), "setup failed");
            scope
                .update_trial(trial.trial_id, Status::Failed, None)
                .await?;
            opt.register(&trial.tunables, Status::Failed, None)?;
            return Ok(());
        }

        // Opportunistic telemetry snapshot before the (blocking) run.
        let (status, telemetry) = env.status().await;
        scope
            .update_telemetry(trial.trial_id, status, telemetry.as_ref())
            .await?;

        let (mut status, results) = env.run().await;
        if self.cancel.is_cancelled() && !status.is_terminal() {
            status = Status::Canceled;
        } else if !status.is_terminal() {
            // A run that never started (e.g. a child left not-ready) is a
            // trial failure, not a scheduler hang.
            status = Status::Failed;
        }
        info!(trial_id = trial.trial_id, %status, "trial complete");

        let score_row = if status.is_succeeded() {
            results.as_ref()
        } else {
            None
        };
        scope
            .update_trial(trial.trial_id, status, results.as_ref())
            .await?;
        opt.register(&trial.tunables, status, score_row)?;
        Ok(())
    }
}

/// Stable fingerprint of the root environment descriptor.
pub fn root_env_hash(env: &dyn Environment) -> String {
    parts_hash_hex([
        env.name().to_string(),
        format!("{:?}", env.kind()),
        env.tunable_params().space_hash(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_core::ParamValue;
    use otto_env::{MockEnv, MockEnvConfig};
    use otto_optimizer::{MockOptimizer, OptimizerConfig};
    use otto_storage::MemoryStorage;
    use otto_tunables::{CovariantGroup, Tunable, TunableDef, TunableKind};

    fn tunables() -> TunableGroups {
        let mut group = CovariantGroup::new("main", 1);
        group
            .add(
                Tunable::new(
                    "x",
                    TunableDef {
                        kind: TunableKind::Int,
                        description: None,
                        default: ParamValue::Int(50),
                        values: None,
                        range: Some((0.0, 100.0)),
                        quantization: None,
                        log: None,
                        distribution: None,
                        special: None,
                        values_weights: None,
                        special_weights: None,
                        range_weight: None,
                        meta: Default::default(),
                    },
                )
                .unwrap(),
            )
            .unwrap();
        let mut groups = TunableGroups::new();
        groups.add_group(group).unwrap();
        groups
    }

    #[tokio::test]
    async fn test_optimize_runs_to_convergence() {
        let space = tunables();
        let mut env = MockEnv::new(
            "mock",
            MockEnvConfig::default(),
            &ParamDict::new(),
            &space,
        )
        .unwrap();
        let config = OptimizerConfig {
            max_iterations: Some(5),
            ..Default::default()
        };
        let mut opt = MockOptimizer::new(space, &config).unwrap();
        let storage = MemoryStorage::new();
        let driver = ExperimentDriver::new("drv-test", ParamDict::new());
        let best = driver
            .optimize(&mut env, &mut opt, &storage)
            .await
            .unwrap();
        assert!(best.is_some());
        // All five trials persisted and terminal.
        let scope = storage
            .experiment(
                ExperimentSpec {
                    experiment_id: "drv-test".into(),
                    root_env_hash: String::new(),
                    opt_target: "score".into(),
                    param_space_hash: String::new(),
                    description: None,
                    merge_experiments: Vec::new(),
                },
            )
            .await;
        // Incompatible re-open is rejected (wrong hashes).
        assert!(scope.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_before_start() {
        let space = tunables();
        let mut env = MockEnv::new(
            "mock",
            MockEnvConfig::default(),
            &ParamDict::new(),
            &space,
        )
        .unwrap();
        let mut opt = MockOptimizer::new(space, &OptimizerConfig::default()).unwrap();
        let storage = MemoryStorage::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let driver =
            ExperimentDriver::new("drv-cancel", ParamDict::new()).with_cancel(cancel);
        let best = driver
            .optimize(&mut env, &mut opt, &storage)
            .await
            .unwrap();
        assert!(best.is_none());
    }
}
