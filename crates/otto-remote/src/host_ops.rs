//! Host provisioning, power and remote execution operations.
//!
//! The endpoint layout is management-API-style (deployments, hosts,
//! `runCommand`) but the observable behavior of every operation depends only
//! on the shared polling contract, so other providers can be adapted by
//! exporting the same operations.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use otto_core::{merge_params, Error, ParamDict, ParamValue, Result, Status};
use otto_services::{Service, ServiceContext};

use crate::poller::{RestOpClient, BODY_PARAM, POLL_URL_PARAM};

/// Configuration of the host operations service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOpsConfig {
    /// Management endpoint, e.g. `https://management.example.com`.
    pub base_url: String,
    /// Opaque bearer token.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub subscription: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub deployment_name: String,
    /// Deployment template submitted on `host_provision`.
    #[serde(default)]
    pub deployment_template: serde_json::Value,
    /// Default parameter values plugged into the template.
    #[serde(default)]
    pub deployment_params: ParamDict,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: f64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_s: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: f64,
}

fn default_poll_interval() -> f64 {
    4.0
}

fn default_poll_timeout() -> f64 {
    300.0
}

fn default_request_timeout() -> f64 {
    5.0
}

impl HostOpsConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        HostOpsConfig {
            base_url: base_url.into(),
            access_token: None,
            subscription: String::new(),
            resource_group: String::new(),
            deployment_name: String::new(),
            deployment_template: serde_json::Value::Null,
            deployment_params: ParamDict::new(),
            poll_interval_s: default_poll_interval(),
            poll_timeout_s: default_poll_timeout(),
            request_timeout_s: default_request_timeout(),
        }
    }
}

/// Service wrapping the async REST contract for one target host fleet.
pub struct HostOpsService {
    config: HostOpsConfig,
    base_params: ParamDict,
    client: RestOpClient,
}

impl HostOpsService {
    pub fn new(config: HostOpsConfig) -> Result<Self> {
        let client = RestOpClient::new(config.access_token.as_deref())?
            .with_timeouts(
                std::time::Duration::from_secs_f64(config.poll_interval_s),
                std::time::Duration::from_secs_f64(config.poll_timeout_s),
                std::time::Duration::from_secs_f64(config.request_timeout_s),
            )?
            .with_base_url(&config.base_url);
        let mut base_params = ParamDict::new();
        base_params.insert(
            "subscription".into(),
            ParamValue::Text(config.subscription.clone()),
        );
        base_params.insert(
            "resourceGroup".into(),
            ParamValue::Text(config.resource_group.clone()),
        );
        base_params.insert(
            "deploymentName".into(),
            ParamValue::Text(config.deployment_name.clone()),
        );
        Ok(HostOpsService {
            config,
            base_params,
            client,
        })
    }

    fn deployment_url(&self, config: &ParamDict) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/deployments/{}?api-version=2022-05-01",
            self.config.base_url.trim_end_matches('/'),
            text_of(config, "subscription"),
            text_of(config, "resourceGroup"),
            text_of(config, "deploymentName"),
        )
    }

    fn host_url(&self, config: &ParamDict, action: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/hosts/{}/{}?api-version=2022-03-01",
            self.config.base_url.trim_end_matches('/'),
            text_of(config, "subscription"),
            text_of(config, "resourceGroup"),
            text_of(config, "hostName"),
            action,
        )
    }

    /// Merge the service defaults with per-call parameters, checking that the
    /// required keys are present.
    fn call_config(&self, params: &ParamDict, required: &[&str]) -> Result<ParamDict> {
        let mut config = self.base_params.clone();
        merge_params(&mut config, params, required)?;
        Ok(config)
    }

    async fn host_power_op(
        &self,
        action: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        let config = self.call_config(params, &["hostName"])?;
        info!(action, host = text_of(&config, "hostName"), "host power operation");
        let url = self.host_url(&config, action);
        self.client.start_op(Method::POST, &url, None, &config).await
    }

    /// Submit (or re-submit) the deployment; idempotent by deployment name.
    async fn host_provision(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let mut deploy_params = self.config.deployment_params.clone();
        merge_params(&mut deploy_params, params, &[])?;
        let config = self.call_config(params, &[])?;
        info!(deployment = text_of(&config, "deploymentName"), "provision host");

        let template_params: serde_json::Map<String, serde_json::Value> = deploy_params
            .iter()
            .filter(|(key, _)| {
                self.config
                    .deployment_template
                    .get("parameters")
                    .and_then(|p| p.get(key.as_str()))
                    .is_some()
            })
            .map(|(key, value)| (key.clone(), json!({ "value": value.to_json() })))
            .collect();
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": self.config.deployment_template,
                "parameters": template_params,
            }
        });

        let url = self.deployment_url(&config);
        self.client.start_deployment(&url, &body, &config).await
    }

    async fn host_deprovision(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        // Deallocate rather than power off: releases the compute resources so
        // a fresh provision starts from a clean slate.
        self.host_power_op("deallocate", params).await
    }

    async fn wait_host_deployment(
        &self,
        params: &ParamDict,
        ctx: &ServiceContext<'_>,
    ) -> Result<(Status, ParamDict)> {
        let config = self.call_config(params, &[])?;
        info!(deployment = text_of(&config, "deploymentName"), "wait for deployment");
        let mut wait_params = config.clone();
        wait_params
            .entry(POLL_URL_PARAM.to_string())
            .or_insert_with(|| ParamValue::Text(self.deployment_url(&config)));
        self.client
            .wait_deployment(&wait_params, ctx.cancel_token())
            .await
    }

    async fn wait_host_operation(
        &self,
        params: &ParamDict,
        ctx: &ServiceContext<'_>,
    ) -> Result<(Status, ParamDict)> {
        self.client.wait_op(params, ctx.cancel_token()).await
    }

    async fn remote_exec(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let config = self.call_config(params, &["hostName", "script"])?;
        let script: Vec<&str> = config
            .get("script")
            .and_then(ParamValue::as_str)
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        info!(host = text_of(&config, "hostName"), lines = script.len(), "remote exec");

        let body = json!({
            "commandId": "RunShellScript",
            "script": script,
            "parameters": config
                .iter()
                .filter(|(key, _)| key.as_str() != "script")
                .map(|(key, value)| json!({"name": key, "value": value.to_json()}))
                .collect::<Vec<_>>(),
        });
        let url = self.host_url(&config, "runCommand");
        self.client.start_op(Method::POST, &url, Some(&body), &config).await
    }

    /// Wait for a pending remote command and extract its output.
    async fn get_remote_exec_results(
        &self,
        params: &ParamDict,
        ctx: &ServiceContext<'_>,
    ) -> Result<(Status, ParamDict)> {
        let (status, mut out) = self.wait_host_operation(params, ctx).await?;
        if !status.is_succeeded() {
            return Ok((status, out));
        }
        let stdout = out
            .get(BODY_PARAM)
            .and_then(ParamValue::as_str)
            .and_then(|body| serde_json::from_str::<serde_json::Value>(body).ok())
            .and_then(|body| {
                body.pointer("/properties/output")?.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.get("message").and_then(|m| m.as_str()).map(String::from))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            });
        if let Some(stdout) = stdout {
            out.insert("stdout".into(), ParamValue::Text(stdout));
        }
        Ok((status, out))
    }
}

fn text_of<'a>(params: &'a ParamDict, key: &str) -> &'a str {
    params.get(key).and_then(ParamValue::as_str).unwrap_or("")
}

#[async_trait]
impl Service for HostOpsService {
    fn exports(&self) -> Vec<&'static str> {
        vec![
            "host_provision",
            "host_deprovision",
            "host_start",
            "host_stop",
            "host_restart",
            "wait_host_deployment",
            "wait_host_operation",
            "remote_exec",
            "get_remote_exec_results",
        ]
    }

    async fn invoke(
        &self,
        ctx: &ServiceContext<'_>,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        match op {
            "host_provision" => self.host_provision(params).await,
            "host_deprovision" => self.host_deprovision(params).await,
            "host_start" => self.host_power_op("start", params).await,
            "host_stop" => self.host_power_op("powerOff", params).await,
            "host_restart" => self.host_power_op("restart", params).await,
            "wait_host_deployment" => self.wait_host_deployment(params, ctx).await,
            "wait_host_operation" => self.wait_host_operation(params, ctx).await,
            "remote_exec" => self.remote_exec(params).await,
            "get_remote_exec_results" => self.get_remote_exec_results(params, ctx).await,
            other => {
                error!(op = other, "unsupported host operation");
                Err(Error::config(format!("unsupported operation: {other}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_services::ServiceRegistry;
    use std::sync::Arc;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn registry_for(server: &MockServer) -> ServiceRegistry {
        let mut config = HostOpsConfig::new(server.uri());
        config.subscription = "sub-1".into();
        config.resource_group = "rg-1".into();
        config.deployment_name = "otto-bench-001".into();
        config.poll_interval_s = 0.05;
        config.poll_timeout_s = 2.0;
        config.request_timeout_s = 0.5;
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(HostOpsService::new(config).unwrap()));
        registry
    }

    #[tokio::test]
    async fn test_host_start_maps_http_statuses() {
        for (code, expected) in [
            (200, Status::Succeeded),
            (202, Status::Pending),
            (401, Status::Failed),
            (404, Status::Failed),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path_regex(r"^/subscriptions/.*/hosts/test-host/start$"))
                .respond_with(ResponseTemplate::new(code))
                .mount(&server)
                .await;
            let registry = registry_for(&server).await;
            let mut params = ParamDict::new();
            params.insert("hostName".into(), ParamValue::Text("test-host".into()));
            let (status, _) = registry.call("host_start", &params).await.unwrap();
            assert_eq!(status, expected, "http {code}");
        }
    }

    #[tokio::test]
    async fn test_start_then_wait_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/hosts/test-host/start$"))
            .respond_with(
                ResponseTemplate::new(202).insert_header("async-op", "/op/42"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/op/42$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "Succeeded"})),
            )
            .mount(&server)
            .await;

        let registry = registry_for(&server).await;
        let mut params = ParamDict::new();
        params.insert("hostName".into(), ParamValue::Text("test-host".into()));
        let (status, out) = registry.call("host_start", &params).await.unwrap();
        assert_eq!(status, Status::Pending);
        let (status, _) = registry.call("wait_host_operation", &out).await.unwrap();
        assert_eq!(status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_remote_exec_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/hosts/bench-host/runCommand$"))
            .respond_with(
                ResponseTemplate::new(202).insert_header("location", "/op/exec-1"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/op/exec-1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "Succeeded",
                "properties": {"output": [{"message": "score: 42"}]}
            })))
            .mount(&server)
            .await;

        let registry = registry_for(&server).await;
        let mut params = ParamDict::new();
        params.insert("hostName".into(), ParamValue::Text("bench-host".into()));
        params.insert("script".into(), ParamValue::Text("run-bench.sh".into()));
        let (status, out) = registry.call("remote_exec", &params).await.unwrap();
        assert_eq!(status, Status::Pending);
        let (status, out) = registry
            .call("get_remote_exec_results", &out)
            .await
            .unwrap();
        assert_eq!(status, Status::Succeeded);
        assert_eq!(
            out.get("stdout"),
            Some(&ParamValue::Text("score: 42".into()))
        );
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let server = MockServer::start().await;
        let registry = registry_for(&server).await;
        assert!(registry.call("host_start", &ParamDict::new()).await.is_err());
    }
}
