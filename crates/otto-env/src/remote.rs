//! Environment that runs benchmarks on a remote host through the service
//! registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use otto_core::{ParamDict, ParamValue, Result, Status};
use otto_services::ServiceRegistry;
use otto_tunables::TunableGroups;

use crate::environment::{CommonEnvConfig, EnvCore, EnvKind, Environment};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteEnvConfig {
    #[serde(flatten)]
    pub common: CommonEnvConfig,
    /// Power on the host (and wait for it) before the setup script.
    #[serde(default)]
    pub wait_boot: bool,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
}

/// Environment to run benchmarks on a remote host.
pub struct RemoteEnv {
    core: EnvCore,
    config: RemoteEnvConfig,
    services: Arc<ServiceRegistry>,
}

impl RemoteEnv {
    pub fn new(
        name: &str,
        config: RemoteEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
        services: Arc<ServiceRegistry>,
    ) -> Result<Self> {
        if config.setup.is_empty()
            && config.run.is_empty()
            && config.teardown.is_empty()
            && !config.wait_boot
        {
            return Err(otto_core::Error::config(format!(
                "environment {name}: at least one of setup/run/teardown \
                 must be present or wait_boot set to true"
            )));
        }
        let core = EnvCore::new(name, &config.common, global_config, tunables)?;
        Ok(RemoteEnv {
            core,
            config,
            services,
        })
    }

    /// Submit a script to the remote host and wait for its results.
    async fn remote_exec(&self, lines: &[String]) -> Result<(Status, ParamDict)> {
        let mut params = self.core.params().clone();
        params.insert("script".into(), ParamValue::Text(lines.join("\n")));
        let (status, out) = self.services.call("remote_exec", &params).await?;
        if matches!(status, Status::Pending | Status::Succeeded) {
            return self.services.call("get_remote_exec_results", &out).await;
        }
        Ok((status, out))
    }

    /// Benchmark metrics from the remote command output: one `name=value`
    /// pair per line of stdout.
    fn parse_metrics(out: &ParamDict) -> ParamDict {
        let mut row = ParamDict::new();
        if let Some(stdout) = out.get("stdout").and_then(ParamValue::as_str) {
            for line in stdout.lines() {
                if let Some((name, value)) = line.split_once('=') {
                    let name = name.trim();
                    let value = value.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let value = if let Ok(int) = value.parse::<i64>() {
                        ParamValue::Int(int)
                    } else if let Ok(float) = value.parse::<f64>() {
                        ParamValue::Float(float)
                    } else {
                        ParamValue::Text(value.to_string())
                    };
                    row.insert(name.to_string(), value);
                }
            }
        }
        row
    }
}

#[async_trait]
impl Environment for RemoteEnv {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> EnvKind {
        EnvKind::RemoteScript
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

        if self.config.wait_boot {
            info!(env = self.name(), "wait for the remote host to start");
            let (mut status, out) = self
                .services
                .call("host_start", self.core.params())
                .await?;
            if status.is_pending() {
                (status, _) = self.services.call("wait_host_operation", &out).await?;
            }
            if !status.is_succeeded() {
                warn!(env = self.name(), %status, "remote host failed to start");
                return Ok(false);
            }
        }

        if self.config.setup.is_empty() {
            self.core.set_ready(true);
            return Ok(true);
        }
        let (status, _) = self.remote_exec(&self.config.setup).await?;
        info!(env = self.name(), %status, "remote setup complete");
        self.core.set_ready(status.is_succeeded());
        Ok(self.core.is_ready())
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let (status, _) = self.core.status_of();
        if !status.is_ready() || self.config.run.is_empty() {
            return (status, None);
        }
        info!(env = self.name(), "run benchmark remotely");
        match self.remote_exec(&self.config.run).await {
            Ok((status, out)) if status.is_succeeded() => {
                (Status::Succeeded, Some(Self::parse_metrics(&out)))
            }
            Ok((status, _)) => (status, None),
            Err(err) => {
                warn!(env = self.name(), %err, "remote benchmark failed");
                (Status::Failed, None)
            }
        }
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.core.status_of()
    }

    async fn teardown(&mut self) {
        if !self.config.teardown.is_empty() {
            match self.remote_exec(&self.config.teardown).await {
                Ok((status, _)) => info!(env = self.name(), %status, "remote teardown complete"),
                Err(err) => warn!(env = self.name(), %err, "remote teardown failed"),
            }
        }
        self.core.set_ready(false);
    }
}
