//! The environment trait and the state shared by all node kinds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use otto_core::{resolve_references, Error, ParamDict, Result, Status};
use otto_tunables::TunableGroups;

/// Kind of an environment node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvKind {
    Mock,
    LocalScript,
    RemoteScript,
    FileShareSync,
    Composite,
}

/// Configuration fields shared by every environment node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonEnvConfig {
    /// Constant arguments merged under the tunable values.
    #[serde(default)]
    pub const_args: ParamDict,
    /// Keys that must be present in const_args or the global config.
    #[serde(default)]
    pub required_args: Vec<String>,
    /// Names of the covariant groups this environment consumes;
    /// all groups when omitted.
    #[serde(default)]
    pub tunable_params: Option<Vec<String>>,
}

/// A configurable, runnable, tear-downable component.
///
/// `setup` and `teardown` are idempotent: repeated invocation with identical
/// arguments yields the same observable state.
#[async_trait]
pub trait Environment: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EnvKind;

    /// The configuration space consumed by this node (and its children).
    fn tunable_params(&self) -> &TunableGroups;

    /// Set up the environment with the given tunable values.
    ///
    /// Returns `Ok(false)` on operational failure (the node observably stays
    /// fresh); `Err` is reserved for fatal configuration problems.
    async fn setup(&mut self, tunables: &TunableGroups, global_config: &ParamDict) -> Result<bool> {
        self.setup_in(tunables, global_config, &ParamDict::new())
            .await
    }

    /// [`Environment::setup`] with the enclosing composite's parameter dict,
    /// against which `$name` references in const_args are resolved.
    async fn setup_in(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<bool>;

    /// Execute the benchmark; blocks until terminal.
    ///
    /// On success the result is a row indexed by metric name. Transport and
    /// timeout faults are reported through the status, never as panics or
    /// errors.
    async fn run(&mut self) -> (Status, Option<ParamDict>);

    /// Opportunistic status/telemetry snapshot.
    async fn status(&self) -> (Status, Option<ParamDict>);

    /// Tear down the environment; never propagates failures to the caller.
    async fn teardown(&mut self);
}

/// State common to all node implementations: the computed parameter dict,
/// the tunables snapshot and the is-ready flag.
#[derive(Debug, Clone)]
pub struct EnvCore {
    name: String,
    const_args: ParamDict,
    tunable_groups: Option<Vec<String>>,
    tunable_params: TunableGroups,
    params: ParamDict,
    is_ready: bool,
}

impl EnvCore {
    /// Build the shared state, pulling required arguments from the global
    /// config and snapshotting the consumed tunable groups.
    pub fn new(
        name: &str,
        config: &CommonEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
    ) -> Result<Self> {
        let mut const_args = config.const_args.clone();
        for key in const_args.keys().cloned().collect::<Vec<_>>() {
            if let Some(value) = global_config.get(&key) {
                const_args.insert(key, value.clone());
            }
        }
        for key in &config.required_args {
            if const_args.contains_key(key) {
                continue;
            }
            match global_config.get(key) {
                Some(value) => {
                    const_args.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(Error::config(format!(
                        "environment {name}: missing required parameter: {key}"
                    )));
                }
            }
        }
        let tunable_params = match &config.tunable_params {
            Some(groups) => tunables.subgroup(groups)?,
            None => tunables.clone(),
        };
        debug!(env = name, groups = ?config.tunable_params, "environment created");
        Ok(EnvCore {
            name: name.to_string(),
            const_args,
            tunable_groups: config.tunable_params.clone(),
            tunable_params,
            params: ParamDict::new(),
            is_ready: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tunable_params(&self) -> &TunableGroups {
        &self.tunable_params
    }

    pub fn tunable_params_mut(&mut self) -> &mut TunableGroups {
        &mut self.tunable_params
    }

    /// The parameter dict computed by the last setup.
    pub fn params(&self) -> &ParamDict {
        &self.params
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn set_ready(&mut self, is_ready: bool) {
        self.is_ready = is_ready;
    }

    /// Merge const_args with the current tunable values, then override with
    /// matching global-config keys. `$name` references in const_args resolve
    /// against the enclosing composite's parameters first.
    pub fn setup_params(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<&ParamDict> {
        info!(env = %self.name, "setup");
        let const_args = resolve_references(&self.const_args, parent_params);
        let group_names: Vec<String> = match &self.tunable_groups {
            Some(groups) => groups.clone(),
            None => tunables.group_names().map(str::to_string).collect(),
        };
        let mut params = tunables.get_param_values(&group_names, &const_args);
        for (key, value) in global_config {
            if params.contains_key(key) {
                params.insert(key.clone(), value.clone());
            }
        }
        // Refresh the snapshot so it reflects the assignment under test.
        let names: Vec<String> = self
            .tunable_params
            .iter()
            .map(|(t, _)| t.name().to_string())
            .collect();
        let assignments: ParamDict = names
            .into_iter()
            .filter_map(|name| {
                tunables
                    .get(&name)
                    .map(|(live, _)| (name, live.value().clone()))
            })
            .collect();
        self.tunable_params.assign(&assignments)?;
        self.params = params;
        Ok(&self.params)
    }

    /// Default status: READY once set up, PENDING otherwise.
    pub fn status_of(&self) -> (Status, Option<ParamDict>) {
        if self.is_ready {
            (Status::Ready, None)
        } else {
            (Status::Pending, None)
        }
    }
}
