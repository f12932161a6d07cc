//! Task record endpoints.
//!
//! Records are only ever observed through these routes; the reconciliation
//! drivers own all mutation. Every route is scoped to the calling principal:
//! another principal's record is indistinguishable from a missing one.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::routing::get;
use axum::{Json, Router};
use courier_core::{ErrorInfo, TaskRecord, TaskStore};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::db::Principal;
use crate::error::ServerError;
use crate::state::AppState;

/// Register task routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub id: i64,
    pub app_id: String,
    pub state: &'static str,
    pub start_time: String,
    pub use_time_ms: i64,
    pub used_points: i64,
    pub result: Vec<Value>,
    pub error_infos: Vec<ErrorInfo>,
}

fn to_response(r: TaskRecord) -> TaskResponse {
    TaskResponse {
        id: r.id,
        app_id: r.app_id,
        state: r.state.as_str(),
        start_time: r.start_time.to_rfc3339(),
        use_time_ms: r.use_time_ms,
        used_points: r.used_points,
        result: r.result,
        error_infos: r.error_infos,
    }
}

/// Fetch a record, hiding records owned by other principals.
async fn owned_task(
    state: &AppState,
    principal: &Principal,
    id: i64,
) -> Result<TaskRecord, ServerError> {
    let record = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    if record.principal_id != principal.id {
        return Err(ServerError::NotFound(format!("task {id} not found")));
    }
    Ok(record)
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let records = state.store.list_tasks(principal.id).await?;
    Ok(Json(records.into_iter().map(to_response).collect()))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Json<TaskResponse>, ServerError> {
    let record = owned_task(&state, &principal, id).await?;
    Ok(Json(to_response(record)))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ServerError> {
    owned_task(&state, &principal, id).await?;
    state.store.delete_task(id).await?;
    info!(task_id = id, principal = principal.id, "task deleted");
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use courier_core::TaskState;

    #[test]
    fn response_preserves_record_fields() {
        let record = TaskRecord {
            id: 9,
            principal_id: 1,
            app_id: "tts".to_owned(),
            state: TaskState::Completed,
            start_time: chrono::Utc::now(),
            use_time_ms: 1234,
            used_points: 7,
            result: vec![serde_json::json!({ "url": "x" })],
            error_infos: Vec::new(),
        };
        let resp = to_response(record);
        assert_eq!(resp.id, 9);
        assert_eq!(resp.state, "completed");
        assert_eq!(resp.used_points, 7);
        assert_eq!(resp.result[0]["url"], "x");
    }
}
