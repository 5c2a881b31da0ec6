//! Uniform async REST operation contract.
//!
//! An initiating POST/PUT either completes synchronously (HTTP 200), is
//! accepted for background processing (HTTP 202 with a poll URL in the
//! `async-op` header, falling back to `location`, and an optional cadence in
//! `retry-after`), or fails. A separate wait step then polls the URL until a
//! terminal state, a timeout, or cancellation.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use otto_core::{Error, ParamDict, ParamValue, Result, Status};

/// Header carrying the poll URL of an accepted async operation.
pub const ASYNC_OP_HEADER: &str = "async-op";
/// Fallback header for the poll URL.
pub const LOCATION_HEADER: &str = "location";
/// Optional suggested poll cadence, in seconds.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Parameter key under which the poll URL travels between operations.
pub const POLL_URL_PARAM: &str = "poll_url";
/// Parameter key for the suggested poll interval, in seconds.
pub const POLL_INTERVAL_PARAM: &str = "poll_interval";
/// Parameter key carrying the raw JSON body of a completed operation.
pub const BODY_PARAM: &str = "body";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client implementing the shared polling contract.
pub struct RestOpClient {
    client: reqwest::Client,
    headers: HeaderMap,
    /// Base for resolving relative poll URLs from response headers.
    base_url: Option<String>,
    poll_interval: Duration,
    poll_timeout: Duration,
    request_timeout: Duration,
}

impl RestOpClient {
    /// Build a client; `access_token` is consumed as an opaque bearer token.
    pub fn new(access_token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::config("access token is not a valid header value"))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(RestOpClient {
            client,
            headers,
            base_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Resolve a possibly relative poll URL against the configured base.
    fn absolute_url(&self, url: &str) -> String {
        match (&self.base_url, url.starts_with('/')) {
            (Some(base), true) => format!("{base}{url}"),
            _ => url.to_string(),
        }
    }

    pub fn with_timeouts(
        mut self,
        poll_interval: Duration,
        poll_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        self.poll_interval = poll_interval;
        self.poll_timeout = poll_timeout;
        self.request_timeout = request_timeout;
        self.client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(self)
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Initiate an async operation.
    ///
    /// Safe to re-issue after a PENDING result with the same parameters: the
    /// request is a plain idempotent state transition and the poll URL is
    /// derived from the response headers of the (unchanged) operation.
    pub async fn start_op(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        debug!(%method, url, "start remote operation");
        let mut request = self
            .client
            .request(method, url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        match status {
            StatusCode::OK => Ok((Status::Succeeded, params.clone())),
            StatusCode::ACCEPTED => {
                let mut out = params.clone();
                let poll_url = response
                    .headers()
                    .get(ASYNC_OP_HEADER)
                    .or_else(|| response.headers().get(LOCATION_HEADER))
                    .and_then(|v| v.to_str().ok());
                if let Some(poll_url) = poll_url {
                    out.insert(POLL_URL_PARAM.into(), ParamValue::Text(poll_url.into()));
                }
                if let Some(interval) = response
                    .headers()
                    .get(RETRY_AFTER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                {
                    out.insert(POLL_INTERVAL_PARAM.into(), ParamValue::Float(interval));
                }
                Ok((Status::Pending, out))
            }
            other => {
                error!(url, status = %other, "remote operation rejected");
                Ok((Status::Failed, ParamDict::new()))
            }
        }
    }

    /// Submit a deployment. The PUT is idempotent by deployment name: 200
    /// (already exists, updated) and 201 (created) both leave the operation
    /// pending on the deployment URL; anything else is a failure.
    pub async fn start_deployment(
        &self,
        url: &str,
        body: &serde_json::Value,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        debug!(url, "submit deployment");
        let response = self
            .client
            .request(Method::PUT, url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let mut out = params.clone();
                out.insert(POLL_URL_PARAM.into(), ParamValue::Text(url.to_string()));
                Ok((Status::Pending, out))
            }
            other => {
                error!(url, status = %other, "deployment rejected");
                Ok((Status::Failed, ParamDict::new()))
            }
        }
    }

    /// One status probe of a pending operation.
    ///
    /// A request-level I/O timeout maps to RUNNING so the wait loop retries
    /// at the next tick instead of aborting.
    async fn check_op(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let url = match params.get(POLL_URL_PARAM).and_then(ParamValue::as_str) {
            Some(url) => self.absolute_url(url),
            None => return Ok((Status::Pending, ParamDict::new())),
        };
        let url = url.as_str();
        let response = match self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!(url, "poll request timed out; retrying at next tick");
                return Ok((Status::Running, ParamDict::new()));
            }
            Err(err) => return Err(err.into()),
        };
        if response.status() != StatusCode::OK {
            error!(url, status = %response.status(), "poll failed");
            return Ok((Status::Failed, ParamDict::new()));
        }
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        match body.get("status").and_then(serde_json::Value::as_str) {
            Some("InProgress") => Ok((Status::Running, ParamDict::new())),
            Some("Succeeded") => {
                let mut out = scalar_leaves(&body);
                out.insert(BODY_PARAM.into(), ParamValue::Text(body.to_string()));
                Ok((Status::Succeeded, out))
            }
            other => {
                error!(url, status = ?other, "operation did not succeed");
                Ok((Status::Failed, ParamDict::new()))
            }
        }
    }

    /// Existence probe of a deployment: 204 means it is fully provisioned,
    /// 404 means it is still being created.
    async fn check_deployment(&self, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let url = match params.get(POLL_URL_PARAM).and_then(ParamValue::as_str) {
            Some(url) => self.absolute_url(url),
            None => return Ok((Status::Pending, ParamDict::new())),
        };
        let response = match self
            .client
            .head(&url)
            .headers(self.headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!(url, "deployment probe timed out; retrying at next tick");
                return Ok((Status::Running, ParamDict::new()));
            }
            Err(err) => return Err(err.into()),
        };
        match response.status() {
            StatusCode::NO_CONTENT => Ok((Status::Succeeded, ParamDict::new())),
            StatusCode::NOT_FOUND => Ok((Status::Running, ParamDict::new())),
            other => {
                error!(url, status = %other, "deployment probe failed");
                Ok((Status::Failed, ParamDict::new()))
            }
        }
    }

    /// Poll the operation status URL until a terminal state.
    pub async fn wait_op(
        &self,
        params: &ParamDict,
        cancel: &CancellationToken,
    ) -> Result<(Status, ParamDict)> {
        self.wait_while(Probe::OpStatus, params, cancel).await
    }

    /// Poll for deployment existence until a terminal state.
    pub async fn wait_deployment(
        &self,
        params: &ParamDict,
        cancel: &CancellationToken,
    ) -> Result<(Status, ParamDict)> {
        self.wait_while(Probe::Deployment, params, cancel).await
    }

    /// Poll until a terminal state, obeying the suggested cadence.
    ///
    /// The round-trip time of each probe is subtracted from the next sleep so
    /// the effective cadence equals the requested interval. Wall-clock
    /// elapsed beyond the poll timeout yields TIMED_OUT; a canceled token
    /// yields CANCELED at the next tick boundary without further network I/O.
    async fn wait_while(
        &self,
        probe: Probe,
        params: &ParamDict,
        cancel: &CancellationToken,
    ) -> Result<(Status, ParamDict)> {
        let poll_period = params
            .get(POLL_INTERVAL_PARAM)
            .and_then(ParamValue::as_f64)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.poll_interval);
        let deadline = Instant::now() + self.poll_timeout;
        debug!(period_s = poll_period.as_secs_f64(), "wait for remote operation");

        let mut poll_delay = poll_period;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let sleep_for = poll_delay.min(deadline - now);
            if !sleep_for.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok((Status::Canceled, ParamDict::new())),
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            if cancel.is_cancelled() {
                return Ok((Status::Canceled, ParamDict::new()));
            }

            let probe_start = Instant::now();
            let (status, out) = match probe {
                Probe::OpStatus => self.check_op(params).await?,
                Probe::Deployment => self.check_deployment(params).await?,
            };
            if status != Status::Running {
                return Ok((status, out));
            }
            poll_delay = poll_period.saturating_sub(probe_start.elapsed());
        }
        warn!("remote operation timed out");
        Ok((Status::TimedOut, ParamDict::new()))
    }
}

/// What a wait loop probes on each tick.
#[derive(Debug, Clone, Copy)]
enum Probe {
    /// GET the poll URL and inspect the body `status` field.
    OpStatus,
    /// HEAD the deployment URL and inspect the HTTP status code.
    Deployment,
}

/// Collect the scalar leaves of a JSON document into a dotted-name dict.
/// Array elements are indexed by position.
pub(crate) fn scalar_leaves(body: &serde_json::Value) -> ParamDict {
    let mut out = ParamDict::new();
    collect_leaves("", body, &mut out);
    out
}

fn collect_leaves(prefix: &str, value: &serde_json::Value, out: &mut ParamDict) {
    match value {
        serde_json::Value::Object(fields) => {
            for (key, child) in fields {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(&name, child, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_leaves(&format!("{prefix}.{index}"), child, out);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                if let Ok(value) = ParamValue::from_json(scalar) {
                    out.insert(prefix.to_string(), value);
                }
            }
        }
    }
}
