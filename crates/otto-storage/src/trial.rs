//! One concrete execution of an environment with a frozen tunable snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otto_core::{ParamDict, ParamValue, Status};
use otto_tunables::TunableGroups;

/// A trial owned by storage. The tunable snapshot is frozen at creation;
/// mutations to the live tunables thereafter do not affect recorded trials.
/// Once terminal, a trial is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_id: u64,
    pub experiment_id: String,
    pub tunables: TunableGroups,
    pub status: Status,
    pub results: Option<ParamDict>,
    pub telemetry: Option<ParamDict>,
    pub config_hash: String,
    pub ts_start: DateTime<Utc>,
    pub ts_end: Option<DateTime<Utc>>,
}

impl TrialRecord {
    pub fn new(experiment_id: &str, trial_id: u64, tunables: TunableGroups) -> Self {
        TrialRecord {
            trial_id,
            experiment_id: experiment_id.to_string(),
            config_hash: tunables.space_hash(),
            tunables,
            status: Status::Pending,
            results: None,
            telemetry: None,
            ts_start: Utc::now(),
            ts_end: None,
        }
    }

    /// Per-trial parameter dict: the global config plus the trial identity.
    pub fn config(&self, global_config: &ParamDict) -> ParamDict {
        let mut config = global_config.clone();
        config.insert(
            "experiment_id".into(),
            ParamValue::Text(self.experiment_id.clone()),
        );
        config.insert("trial_id".into(), ParamValue::Int(self.trial_id as i64));
        config
    }

    /// Only `pending -> running` and `running -> terminal` are permitted.
    pub fn can_transition(from: Status, to: Status) -> bool {
        matches!(
            (from, to),
            (Status::Pending, Status::Running)
        ) || (from == Status::Running && to.is_terminal())
    }
}
