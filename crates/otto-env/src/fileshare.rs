//! Local-script environment that stages data through a shared file storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use otto_core::{substitute, ParamDict, ParamValue, Result, Status};
use otto_services::ServiceRegistry;
use otto_tunables::TunableGroups;

use crate::environment::{EnvKind, Environment};
use crate::local::{LocalEnv, LocalEnvConfig};

/// A `{from, to}` transfer template; `$name` references are substituted
/// against the environment parameters (plus `PWD`) at transfer time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileShareEnvConfig {
    #[serde(flatten)]
    pub local: LocalEnvConfig,
    /// Uploaded to the share after a successful setup.
    #[serde(default)]
    pub upload: Vec<TransferSpec>,
    /// Downloaded from the share before the run scripts.
    #[serde(default)]
    pub download: Vec<TransferSpec>,
}

/// Runs scripts locally and synchronizes inputs/outputs with the shared
/// file storage.
pub struct FileShareEnv {
    inner: LocalEnv,
    upload: Vec<TransferSpec>,
    download: Vec<TransferSpec>,
    services: Arc<ServiceRegistry>,
}

impl FileShareEnv {
    pub fn new(
        name: &str,
        config: FileShareEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
        services: Arc<ServiceRegistry>,
    ) -> Result<Self> {
        let inner = LocalEnv::new(
            name,
            config.local,
            global_config,
            tunables,
            Arc::clone(&services),
        )?;
        Ok(FileShareEnv {
            inner,
            upload: config.upload,
            download: config.download,
            services,
        })
    }

    /// Run a batch of transfers through the given share operation.
    async fn transfer(&mut self, op: &str, specs: &[TransferSpec]) -> bool {
        let mut params = self.inner.core().params().clone();
        match self.inner.work_dir() {
            Ok(dir) => {
                params.insert(
                    "PWD".into(),
                    ParamValue::Text(dir.to_string_lossy().into_owned()),
                );
            }
            Err(err) => {
                warn!(env = self.name(), %err, "work dir unavailable");
                return false;
            }
        }
        for spec in specs {
            let mut call = params.clone();
            call.insert(
                "from".into(),
                ParamValue::Text(substitute(&spec.from, &params)),
            );
            call.insert("to".into(), ParamValue::Text(substitute(&spec.to, &params)));
            match self.services.call(op, &call).await {
                Ok((status, _)) if status.is_succeeded() => {}
                Ok((status, _)) => {
                    warn!(env = self.name(), op, from = %spec.from, %status, "transfer failed");
                    return false;
                }
                Err(err) => {
                    warn!(env = self.name(), op, from = %spec.from, %err, "transfer failed");
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Environment for FileShareEnv {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> EnvKind {
        EnvKind::FileShareSync
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.inner.tunable_params()
    }

    async fn setup_in(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<bool> {
        if !self
            .inner
            .setup_in(tunables, global_config, parent_params)
            .await?
        {
            return Ok(false);
        }
        let upload = self.upload.clone();
        let ok = self.transfer("upload", &upload).await;
        self.inner.core_mut().set_ready(ok);
        Ok(ok)
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let download = self.download.clone();
        if !self.transfer("download", &download).await {
            return (Status::Failed, None);
        }
        self.inner.run().await
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.inner.status().await
    }

    async fn teardown(&mut self) {
        self.inner.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_services::{FileShareService, LocalExecService};

    #[tokio::test]
    async fn test_setup_uploads_and_run_downloads() {
        let share = tempfile::tempdir().unwrap();
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(LocalExecService::new(None)));
        registry.register(Arc::new(FileShareService::new(share.path())));
        let services = Arc::new(registry);

        let mut config = FileShareEnvConfig::default();
        config.local.setup = vec!["echo x=1 > params.ini".into()];
        config.local.run =
            vec!["printf 'score\\n' > results.csv; cat fetched.ini >> results.csv".into()];
        config.local.read_results_file = Some("results.csv".into());
        config.upload = vec![TransferSpec {
            from: "$PWD/params.ini".into(),
            to: "staging/params.ini".into(),
        }];
        config.download = vec![TransferSpec {
            from: "staging/params.ini".into(),
            to: "$PWD/fetched.ini".into(),
        }];

        let mut env = FileShareEnv::new(
            "staged",
            config,
            &ParamDict::new(),
            &TunableGroups::new(),
            services,
        )
        .unwrap();
        assert!(env
            .setup(&TunableGroups::new(), &ParamDict::new())
            .await
            .unwrap());
        assert!(share.path().join("staging/params.ini").exists());

        let (status, row) = env.run().await;
        assert_eq!(status, Status::Succeeded);
        // The downloaded file round-tripped through the share into the
        // results the run script produced.
        assert_eq!(
            row.unwrap().get("score"),
            Some(&ParamValue::Text("x=1".into()))
        );
    }
}
