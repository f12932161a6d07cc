//! Job submission routes – async task pattern.
//!
//! All three endpoints return `{"task_id": n}` with HTTP 202 as soon as the
//! record exists; callers poll `GET /v1/tasks/{id}` for the outcome. The
//! ledger pre-check runs before any record is created, so an unaffordable or
//! invalid submission leaves no trace.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use courier_core::{BatchItemOutput, JobRequest, StreamDriver, StreamOptions};
use serde::Deserialize;
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::db::Principal;
use crate::error::ServerError;
use crate::providers::stream::WsStreamTransport;
use crate::state::AppState;

/// Register job submission routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/stream", post(submit_stream_job))
        .route("/jobs/batch", post(submit_batch))
}

#[derive(Deserialize, ToSchema)]
pub struct SubmitJobRequest {
    pub app_id: String,
    #[serde(default)]
    pub params: Value,
    /// Caller-supplied pre-estimate in points; derived from the input when
    /// absent.
    pub cost_estimate: Option<i64>,
}

#[derive(Deserialize, ToSchema)]
pub struct SubmitBatchRequest {
    pub app_id: String,
    pub items: Vec<Value>,
    pub cost_estimate: Option<i64>,
}

/// Pre-estimate: input length × unit price for text jobs, one flat unit
/// otherwise. The actual provider-reported cost is billed on completion.
fn estimate_cost(params: &Value, unit_price: i64) -> i64 {
    params
        .get("text")
        .and_then(|v| v.as_str())
        .map(|t| (t.chars().count() as i64).max(1) * unit_price)
        .unwrap_or(unit_price)
}

/// Submit a polled job (`POST /v1/jobs`).
///
/// The job is submitted to the configured HTTP provider and reconciled by
/// status polling until the provider reports a terminal state or the retry
/// budget runs out.
#[utoipa::path(
    post,
    path = "/v1/jobs",
    tag = "jobs",
    responses(
        (status = 202, description = "Task accepted", body = Value),
        (status = 400, description = "Bad request"),
        (status = 402, description = "Insufficient points"),
    )
)]
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let estimate = body
        .cost_estimate
        .unwrap_or_else(|| estimate_cost(&body.params, state.config.unit_price));
    let req = JobRequest {
        principal_id: principal.id,
        app_id: body.app_id.clone(),
        params: body.params,
        cost_estimate: estimate,
    };

    let submit_provider = Arc::clone(&state.provider);
    let query_provider = Arc::clone(&state.provider);
    let app_id = body.app_id;
    let task_id = state
        .orchestrator
        .submit_polled_job(
            req,
            move |params| async move { submit_provider.submit(&app_id, &params).await },
            move |handle| {
                let provider = Arc::clone(&query_provider);
                async move { provider.query_status(&handle).await }
            },
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

/// Submit a streaming synthesis job (`POST /v1/jobs/stream`).
///
/// The job runs over the provider's duplex stream transport; accumulated
/// binary output is returned base64-encoded in the task result. Responds 503
/// when the provider has no stream transport configured.
#[utoipa::path(
    post,
    path = "/v1/jobs/stream",
    tag = "jobs",
    responses(
        (status = 202, description = "Task accepted", body = Value),
        (status = 402, description = "Insufficient points"),
        (status = 503, description = "No stream transport configured"),
    )
)]
pub async fn submit_stream_job(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let Some(stream_url) = state.config.provider_stream_url.clone() else {
        return Err(ServerError::StreamUnavailable(
            "provider has no stream transport configured".to_owned(),
        ));
    };

    let estimate = body
        .cost_estimate
        .unwrap_or_else(|| estimate_cost(&body.params, state.config.unit_price));
    let req = JobRequest {
        principal_id: principal.id,
        app_id: body.app_id.clone(),
        params: body.params,
        cost_estimate: estimate,
    };

    let app_id = body.app_id;
    let task_id = state
        .orchestrator
        .submit_streaming_job(
            req,
            move || async move { WsStreamTransport::new(stream_url).open(&app_id).await },
            |outcome| async move {
                let mut fragments = vec![json!({
                    "output_b64": BASE64.encode(&outcome.data),
                    "bytes": outcome.data.len(),
                })];
                if let Some(payload) = outcome.payload {
                    fragments.push(payload);
                }
                Ok(fragments)
            },
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

/// Submit a fan-out batch of synthesis items (`POST /v1/jobs/batch`).
///
/// Each item runs as its own stream unit job under bounded concurrency; the
/// batch is one task record whose result lists the per-item outcomes.
#[utoipa::path(
    post,
    path = "/v1/jobs/batch",
    tag = "jobs",
    responses(
        (status = 202, description = "Task accepted", body = Value),
        (status = 400, description = "Bad request"),
        (status = 402, description = "Insufficient points"),
        (status = 503, description = "No stream transport configured"),
    )
)]
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SubmitBatchRequest>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let Some(stream_url) = state.config.provider_stream_url.clone() else {
        return Err(ServerError::StreamUnavailable(
            "provider has no stream transport configured".to_owned(),
        ));
    };

    let estimate = body.cost_estimate.unwrap_or_else(|| {
        body.items
            .iter()
            .map(|item| estimate_cost(item, state.config.unit_price))
            .sum()
    });
    let req = JobRequest {
        principal_id: principal.id,
        app_id: body.app_id.clone(),
        params: Value::Null,
        cost_estimate: estimate,
    };

    let stream_opts = StreamOptions {
        run_timeout: state.config.stream_timeout,
        ..Default::default()
    };
    let app_id = body.app_id;
    let task_id = state
        .orchestrator
        .submit_batch(req, body.items, move |item| {
            let transport = WsStreamTransport::new(stream_url.clone());
            let opts = stream_opts.clone();
            let app_id = app_id.clone();
            async move {
                let conn = transport.open(&app_id).await?;
                let outcome = StreamDriver::new(opts).run(item, conn).await?;
                Ok(BatchItemOutput {
                    units: outcome.billed_units.unwrap_or(outcome.data.len() as i64),
                    payload: outcome.payload,
                })
            }
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_jobs_are_estimated_per_character() {
        assert_eq!(estimate_cost(&json!({ "text": "hello" }), 2), 10);
        assert_eq!(estimate_cost(&json!({ "text": "" }), 2), 2);
    }

    #[test]
    fn non_text_jobs_are_estimated_one_flat_unit() {
        assert_eq!(estimate_cost(&json!({ "image": "x.png" }), 5), 5);
        assert_eq!(estimate_cost(&Value::Null, 3), 3);
    }
}
