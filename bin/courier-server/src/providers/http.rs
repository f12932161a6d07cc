//! Generic JSON-over-HTTP provider adapter.
//!
//! Wire shape:
//! - `POST {base}/jobs` with `{"app_id": ..., "params": ...}` returns
//!   `{"job_id": "..."}`.
//! - `GET {base}/jobs/{job_id}` returns `{"status": "queued|running|
//!   succeeded|failed", "payload": ..., "cost": n, "error": {"code": ...,
//!   "message": ...}}`.
//!
//! Transport-level failures and retryable upstream statuses (429, 5xx) map
//! to [`CoreError::Transport`]; everything the provider explicitly rejects
//! maps to [`CoreError::Provider`].

use courier_core::{CoreError, ErrorInfo, JobHandle, StatusReport};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(cfg: &Config) -> Self {
        let client = Client::builder()
            .user_agent(concat!("courier-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: cfg.provider_url.trim_end_matches('/').to_owned(),
            api_key: cfg.provider_api_key.clone(),
        }
    }

    fn authorised(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Submit one job, returning the provider's opaque handle.
    pub async fn submit(&self, app_id: &str, params: &Value) -> Result<JobHandle, CoreError> {
        let url = format!("{}/jobs", self.base_url);
        let resp = self
            .authorised(self.client.post(&url))
            .json(&json!({ "app_id": app_id, "params": params }))
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(upstream_error(status, resp.text().await.ok()));
        }

        let body: Value = resp.json().await.map_err(transport)?;
        let job_id = body
            .get("job_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Provider {
                code: None,
                message: "submission response is missing job_id".to_owned(),
            })?;
        debug!(app_id, job_id, "job submitted to provider");
        Ok(JobHandle(job_id.to_owned()))
    }

    /// Answer one status poll for a previously submitted job.
    pub async fn query_status(&self, handle: &JobHandle) -> Result<StatusReport, CoreError> {
        let url = format!("{}/jobs/{}", self.base_url, handle);
        let resp = self
            .authorised(self.client.get(&url))
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(upstream_error(status, resp.text().await.ok()));
        }

        let body: Value = resp.json().await.map_err(transport)?;
        match body.get("status").and_then(|v| v.as_str()) {
            Some("queued") | Some("running") => Ok(StatusReport::running()),
            Some("succeeded") => Ok(StatusReport::succeeded(
                body.get("payload").cloned(),
                body.get("cost").and_then(|v| v.as_i64()),
            )),
            Some("failed") => {
                let message = body
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("provider reported failure")
                    .to_owned();
                let code = body
                    .pointer("/error/code")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                Ok(StatusReport::failed(match code {
                    Some(code) => ErrorInfo::with_details(message, format!("provider code {code}")),
                    None => ErrorInfo::new(message),
                }))
            }
            other => Err(CoreError::Provider {
                code: None,
                message: format!("unrecognised provider status {other:?}"),
            }),
        }
    }
}

fn transport(e: reqwest::Error) -> CoreError {
    CoreError::Transport(e.to_string())
}

fn upstream_error(status: StatusCode, body: Option<String>) -> CoreError {
    let message = body
        .as_deref()
        .and_then(|b| serde_json::from_str::<Value>(b).ok())
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| format!("provider returned HTTP {status}"));

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CoreError::Transport(message)
    } else {
        CoreError::Provider {
            code: Some(status.as_u16().to_string()),
            message,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert!(upstream_error(StatusCode::TOO_MANY_REQUESTS, None).is_retryable());
        assert!(upstream_error(StatusCode::BAD_GATEWAY, None).is_retryable());
        assert!(!upstream_error(StatusCode::UNPROCESSABLE_ENTITY, None).is_retryable());
    }

    #[test]
    fn upstream_error_prefers_provider_message() {
        let err = upstream_error(
            StatusCode::BAD_REQUEST,
            Some(r#"{"error": {"message": "voice not found"}}"#.to_owned()),
        );
        match err {
            CoreError::Provider { code, message } => {
                assert_eq!(code.as_deref(), Some("400"));
                assert_eq!(message, "voice not found");
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }
}
