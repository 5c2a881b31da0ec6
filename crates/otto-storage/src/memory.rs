//! In-memory storage backend for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use otto_core::{Error, ParamDict, ParamValue, Result, Status};
use otto_tunables::TunableGroups;

use crate::storage::{ExperimentScope, ExperimentSpec, Storage};
use crate::trial::TrialRecord;

#[derive(Debug, Clone)]
struct ExperimentMeta {
    root_env_hash: String,
    opt_target: String,
    param_space_hash: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    experiments: HashMap<String, ExperimentMeta>,
    trials: HashMap<String, BTreeMap<u64, TrialRecord>>,
}

/// Storage that keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn experiment(&self, spec: ExperimentSpec) -> Result<Box<dyn ExperimentScope>> {
        let mut state = self.state.write().await;
        match state.experiments.get(&spec.experiment_id) {
            Some(existing) => {
                verify_compatible(&spec, existing)?;
                info!(experiment = spec.experiment_id, "resume experiment");
            }
            None => {
                state.experiments.insert(
                    spec.experiment_id.clone(),
                    ExperimentMeta {
                        root_env_hash: spec.root_env_hash.clone(),
                        opt_target: spec.opt_target.clone(),
                        param_space_hash: spec.param_space_hash.clone(),
                    },
                );
                info!(experiment = spec.experiment_id, "create experiment");
            }
        }
        Ok(Box::new(MemoryScope {
            state: Arc::clone(&self.state),
            spec,
        }))
    }
}

fn verify_compatible(spec: &ExperimentSpec, existing: &ExperimentMeta) -> Result<()> {
    let mismatch = |reason: &str| {
        Err(Error::ExperimentMismatch {
            experiment_id: spec.experiment_id.clone(),
            reason: reason.to_string(),
        })
    };
    if existing.opt_target != spec.opt_target {
        return mismatch("optimization target differs");
    }
    if existing.param_space_hash != spec.param_space_hash {
        return mismatch("tunable parameter space differs");
    }
    if existing.root_env_hash != spec.root_env_hash {
        return mismatch("root environment differs");
    }
    Ok(())
}

struct MemoryScope {
    state: Arc<RwLock<MemoryState>>,
    spec: ExperimentSpec,
}

#[async_trait]
impl ExperimentScope for MemoryScope {
    fn experiment_id(&self) -> &str {
        &self.spec.experiment_id
    }

    async fn load(&self) -> Result<(Vec<ParamDict>, Vec<Option<f64>>, Vec<Status>)> {
        let state = self.state.read().await;
        let mut configs = Vec::new();
        let mut scores = Vec::new();
        let mut statuses = Vec::new();
        let ids = std::iter::once(&self.spec.experiment_id).chain(&self.spec.merge_experiments);
        for experiment_id in ids {
            let Some(trials) = state.trials.get(experiment_id) else {
                continue;
            };
            for trial in trials.values().filter(|t| t.status.is_terminal()) {
                configs.push(trial.tunables.values());
                scores.push(extract_score(trial, &self.spec.opt_target));
                statuses.push(trial.status);
            }
        }
        Ok((configs, scores, statuses))
    }

    async fn pending_trials(&self) -> Result<Vec<TrialRecord>> {
        let state = self.state.read().await;
        Ok(state
            .trials
            .get(&self.spec.experiment_id)
            .map(|trials| {
                trials
                    .values()
                    .filter(|t| !t.status.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn new_trial(&mut self, tunables: &TunableGroups) -> Result<TrialRecord> {
        let mut state = self.state.write().await;
        let trials = state
            .trials
            .entry(self.spec.experiment_id.clone())
            .or_default();
        let trial_id = trials.keys().next_back().map_or(1, |last| last + 1);
        let trial = TrialRecord::new(&self.spec.experiment_id, trial_id, tunables.clone());
        trials.insert(trial_id, trial.clone());
        info!(experiment = self.spec.experiment_id, trial_id, "trial allocated");
        Ok(trial)
    }

    async fn update_trial(
        &mut self,
        trial_id: u64,
        status: Status,
        results: Option<&ParamDict>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let trial = state
            .trials
            .get_mut(&self.spec.experiment_id)
            .and_then(|trials| trials.get_mut(&trial_id))
            .ok_or_else(|| Error::storage(format!("no such trial: {trial_id}")))?;
        if !TrialRecord::can_transition(trial.status, status) {
            return Err(Error::storage(format!(
                "invalid trial transition: {} -> {status}",
                trial.status
            )));
        }
        trial.status = status;
        trial.results = results.cloned();
        if status.is_terminal() {
            trial.ts_end = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn update_telemetry(
        &mut self,
        trial_id: u64,
        status: Status,
        telemetry: Option<&ParamDict>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let trial = state
            .trials
            .get_mut(&self.spec.experiment_id)
            .and_then(|trials| trials.get_mut(&trial_id))
            .ok_or_else(|| Error::storage(format!("no such trial: {trial_id}")))?;
        if trial.status.is_terminal() {
            return Err(Error::storage("trial is already terminal".to_string()));
        }
        trial.telemetry = telemetry.cloned();
        let _ = status; // telemetry snapshots do not transition the trial
        Ok(())
    }
}

pub(crate) fn extract_score(trial: &TrialRecord, opt_target: &str) -> Option<f64> {
    if !trial.status.is_succeeded() {
        return None;
    }
    trial
        .results
        .as_ref()
        .and_then(|row| row.get(opt_target))
        .and_then(ParamValue::as_f64)
}
