//! Environment that runs benchmark scripts locally on the scheduler node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use otto_core::{ParamDict, ParamValue, Result, Status};
use otto_services::ServiceRegistry;
use otto_tunables::TunableGroups;

use crate::environment::{CommonEnvConfig, EnvCore, EnvKind, Environment};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalEnvConfig {
    #[serde(flatten)]
    pub common: CommonEnvConfig,
    /// Commands run once per trial to prepare the workload.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Commands that execute the benchmark.
    #[serde(default)]
    pub run: Vec<String>,
    /// Commands run at teardown.
    #[serde(default)]
    pub teardown: Vec<String>,
    /// File (relative to the work dir) to dump the tunable values into
    /// before the setup script runs.
    #[serde(default)]
    pub dump_params_file: Option<String>,
    /// One-row CSV file (relative to the work dir) the run script leaves the
    /// benchmark metrics in.
    #[serde(default)]
    pub read_results_file: Option<String>,
    /// Work directory; a per-trial temp dir when omitted.
    #[serde(default)]
    pub temp_dir: Option<String>,
}

/// Scheduler-side benchmark environment that runs scripts locally.
pub struct LocalEnv {
    core: EnvCore,
    config: LocalEnvConfig,
    services: Arc<ServiceRegistry>,
    /// Keeps a generated work dir alive between setup and run.
    scratch: Option<tempfile::TempDir>,
}

impl LocalEnv {
    pub fn new(
        name: &str,
        config: LocalEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
        services: Arc<ServiceRegistry>,
    ) -> Result<Self> {
        if config.setup.is_empty() && config.run.is_empty() && config.teardown.is_empty() {
            return Err(otto_core::Error::config(format!(
                "environment {name}: at least one of setup/run/teardown must be present"
            )));
        }
        if config.dump_params_file.is_some() && config.setup.is_empty() {
            return Err(otto_core::Error::config(format!(
                "environment {name}: dump_params_file requires a setup script"
            )));
        }
        if config.read_results_file.is_some() && config.run.is_empty() {
            return Err(otto_core::Error::config(format!(
                "environment {name}: read_results_file requires a run script"
            )));
        }
        let core = EnvCore::new(name, &config.common, global_config, tunables)?;
        Ok(LocalEnv {
            core,
            config,
            services,
            scratch: None,
        })
    }

    pub(crate) fn core(&self) -> &EnvCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut EnvCore {
        &mut self.core
    }

    /// Work directory for this trial, creating a scratch dir on first use.
    pub(crate) fn work_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.config.temp_dir {
            return Ok(PathBuf::from(dir));
        }
        if self.scratch.is_none() {
            self.scratch = Some(tempfile::tempdir()?);
        }
        Ok(self
            .scratch
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .unwrap_or_default())
    }

    /// Run one of the script phases through the `local_exec` service.
    async fn exec_script(&mut self, lines: &[String]) -> Result<(Status, ParamDict)> {
        let work_dir = self.work_dir()?;
        let mut params = self.core.params().clone();
        params.insert("script".into(), ParamValue::Text(lines.join("\n")));
        params.insert(
            "cwd".into(),
            ParamValue::Text(work_dir.to_string_lossy().into_owned()),
        );
        self.services.call("local_exec", &params).await
    }

    fn read_results(&self, work_dir: &Path) -> Result<ParamDict> {
        let file = match &self.config.read_results_file {
            Some(file) => work_dir.join(file),
            None => return Ok(ParamDict::new()),
        };
        let mut reader = csv::Reader::from_path(&file).map_err(|err| {
            otto_core::Error::config(format!(
                "cannot read results file {}: {err}",
                file.display()
            ))
        })?;
        let headers = reader.headers().map_err(csv_err)?.clone();
        let mut row = ParamDict::new();
        if let Some(record) = reader.records().next() {
            let record = record.map_err(csv_err)?;
            for (name, field) in headers.iter().zip(record.iter()) {
                let value = if let Ok(int) = field.parse::<i64>() {
                    ParamValue::Int(int)
                } else if let Ok(float) = field.parse::<f64>() {
                    ParamValue::Float(float)
                } else {
                    ParamValue::Text(field.to_string())
                };
                row.insert(name.to_string(), value);
            }
        }
        Ok(row)
    }
}

fn csv_err(err: csv::Error) -> otto_core::Error {
    otto_core::Error::config(format!("malformed results file: {err}"))
}

#[async_trait]
impl Environment for LocalEnv {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> EnvKind {
        EnvKind::LocalScript
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.core.tunable_params()
    }

    async fn setup_in(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<bool> {
        self.core
            .setup_params(tunables, global_config, parent_params)?;
        if self.config.setup.is_empty() {
            self.core.set_ready(true);
            return Ok(true);
        }

        let work_dir = self.work_dir()?;
        if let Some(file) = &self.config.dump_params_file {
            let values = self.core.tunable_params().values();
            let json = serde_json::to_string_pretty(&otto_core::unflatten_params(&values)?)?;
            tokio::fs::write(work_dir.join(file), json).await?;
        }

        let script = self.config.setup.clone();
        let (status, out) = self.exec_script(&script).await?;
        if !status.is_succeeded() {
            warn!(
                env = self.name(),
                stderr = out.get("stderr").and_then(ParamValue::as_str).unwrap_or(""),
                "local setup failed"
            );
        }
        self.core.set_ready(status.is_succeeded());
        Ok(self.core.is_ready())
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let (status, _) = self.core.status_of();
        if !status.is_ready() || self.config.run.is_empty() {
            return (status, None);
        }
        let script = self.config.run.clone();
        let (status, out) = match self.exec_script(&script).await {
            Ok(result) => result,
            Err(err) => {
                warn!(env = self.name(), %err, "local run failed");
                return (Status::Failed, None);
            }
        };
        if !status.is_succeeded() {
            warn!(
                env = self.name(),
                stderr = out.get("stderr").and_then(ParamValue::as_str).unwrap_or(""),
                "local benchmark failed"
            );
            return (Status::Failed, None);
        }
        let work_dir = match self.work_dir() {
            Ok(dir) => dir,
            Err(err) => {
                warn!(env = self.name(), %err, "work dir unavailable");
                return (Status::Failed, None);
            }
        };
        match self.read_results(&work_dir) {
            Ok(row) => {
                info!(env = self.name(), metrics = row.len(), "local benchmark complete");
                (Status::Succeeded, Some(row))
            }
            Err(err) => {
                warn!(env = self.name(), %err, "cannot read benchmark results");
                (Status::Failed, None)
            }
        }
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.core.status_of()
    }

    async fn teardown(&mut self) {
        if !self.config.teardown.is_empty() {
            let script = self.config.teardown.clone();
            if let Err(err) = self.exec_script(&script).await {
                warn!(env = self.core.name(), %err, "local teardown failed");
            }
        }
        self.scratch = None;
        self.core.set_ready(false);
        info!(env = self.core.name(), "teardown complete");
    }
}
