//! Run scripts and commands locally on the scheduler node.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use otto_core::{ParamDict, ParamValue, Result, Status};

use crate::registry::{Service, ServiceContext};

/// Scheduler-side command execution.
///
/// Exports `local_exec`: runs the newline-separated commands from the
/// `script` parameter, one process per line, with the remaining parameters
/// exported as environment variables. Returns `return_code`, `stdout` and
/// `stderr` in the output dict.
pub struct LocalExecService {
    /// Work directory for the scripts; a fresh temp dir per call when unset.
    temp_dir: Option<String>,
    /// Stop at the first failing line instead of running all of them.
    abort_on_error: bool,
}

impl LocalExecService {
    pub fn new(temp_dir: Option<String>) -> Self {
        LocalExecService {
            temp_dir,
            abort_on_error: true,
        }
    }

    pub fn with_abort_on_error(mut self, abort_on_error: bool) -> Self {
        self.abort_on_error = abort_on_error;
        self
    }

    async fn run_script(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let script = params
            .get("script")
            .and_then(ParamValue::as_str)
            .unwrap_or_default();
        let cwd = params
            .get("cwd")
            .and_then(ParamValue::as_str)
            .map(str::to_string)
            .or_else(|| self.temp_dir.clone());

        // Keep the temp dir alive for the duration of the script.
        let scratch;
        let work_dir = match cwd {
            Some(dir) => dir,
            None => {
                scratch = tempfile::tempdir()?;
                scratch.path().to_string_lossy().into_owned()
            }
        };
        debug!(%work_dir, "run local script");

        let mut return_code = 0i64;
        let mut stdout_all = String::new();
        let mut stderr_all = String::new();
        for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            info!(command = line, "local exec");
            let output = Command::new("sh")
                .arg("-c")
                .arg(line)
                .current_dir(&work_dir)
                .envs(params.iter().filter_map(|(key, value)| {
                    (key.as_str() != "script" && !value.is_null())
                        .then(|| (key.clone(), value.to_string()))
                }))
                .output()
                .await?;
            stdout_all.push_str(&String::from_utf8_lossy(&output.stdout));
            stderr_all.push_str(&String::from_utf8_lossy(&output.stderr));
            return_code = output.status.code().unwrap_or(-1) as i64;
            if return_code != 0 {
                warn!(command = line, return_code, "local exec failed");
                if self.abort_on_error {
                    break;
                }
            }
        }

        let mut out = params.clone();
        out.insert("return_code".into(), ParamValue::Int(return_code));
        out.insert("stdout".into(), ParamValue::Text(stdout_all));
        out.insert("stderr".into(), ParamValue::Text(stderr_all));
        let status = if return_code == 0 {
            Status::Succeeded
        } else {
            Status::Failed
        };
        Ok((status, out))
    }
}

#[async_trait]
impl Service for LocalExecService {
    fn exports(&self) -> Vec<&'static str> {
        vec!["local_exec"]
    }

    async fn invoke(
        &self,
        _ctx: &ServiceContext<'_>,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        match op {
            "local_exec" => self.run_script(params).await,
            other => Err(otto_core::Error::config(format!(
                "unsupported operation: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistry;
    use std::sync::Arc;

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(LocalExecService::new(None)));
        registry
    }

    #[tokio::test]
    async fn test_local_exec_success() {
        let mut params = ParamDict::new();
        params.insert("script".into(), ParamValue::Text("echo hello".into()));
        let (status, out) = registry().call("local_exec", &params).await.unwrap();
        assert_eq!(status, Status::Succeeded);
        assert_eq!(out.get("return_code"), Some(&ParamValue::Int(0)));
        assert!(out
            .get("stdout")
            .and_then(ParamValue::as_str)
            .unwrap()
            .contains("hello"));
    }

    #[tokio::test]
    async fn test_local_exec_env_injection() {
        let mut params = ParamDict::new();
        params.insert("script".into(), ParamValue::Text("echo $vm_mem_gb".into()));
        params.insert("vm_mem_gb".into(), ParamValue::Int(8));
        let (_, out) = registry().call("local_exec", &params).await.unwrap();
        assert!(out
            .get("stdout")
            .and_then(ParamValue::as_str)
            .unwrap()
            .contains('8'));
    }

    #[tokio::test]
    async fn test_local_exec_failure_aborts() {
        let mut params = ParamDict::new();
        params.insert(
            "script".into(),
            ParamValue::Text("false\necho not-reached".into()),
        );
        let (status, out) = registry().call("local_exec", &params).await.unwrap();
        assert_eq!(status, Status::Failed);
        assert!(!out
            .get("stdout")
            .and_then(ParamValue::as_str)
            .unwrap()
            .contains("not-reached"));
    }
}
