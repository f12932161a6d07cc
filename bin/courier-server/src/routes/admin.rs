//! Principal provisioning routes, nested under `/admin`.
//!
//! Guarded by the `COURIER_ADMIN_TOKEN` bearer token when set.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::db::PrincipalStore;
use crate::error::ServerError;
use crate::middleware::auth;
use crate::state::AppState;

/// Register admin routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/principals", post(create_principal))
        .route("/principals/{id}/topup", post(top_up))
        .route_layer(middleware::from_fn(auth::check_admin_auth))
}

#[derive(Deserialize)]
pub struct CreatePrincipalRequest {
    #[serde(default)]
    pub initial_balance: i64,
}

#[derive(Deserialize)]
pub struct TopUpRequest {
    pub amount: i64,
}

/// Provision a principal with a fresh API key (`POST /admin/principals`).
pub async fn create_principal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePrincipalRequest>,
) -> Result<Json<Value>, ServerError> {
    if body.initial_balance < 0 {
        return Err(ServerError::BadRequest(
            "initial_balance must not be negative".to_owned(),
        ));
    }

    let api_key = format!("ck-{}", Uuid::new_v4().simple());
    let principal = state
        .store
        .create_principal(&api_key, body.initial_balance)
        .await?;
    info!(principal = principal.id, "principal created");

    Ok(Json(json!({
        "id": principal.id,
        "api_key": principal.api_key,
        "balance": principal.balance,
    })))
}

/// Add prepaid points (`POST /admin/principals/{id}/topup`).
pub async fn top_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TopUpRequest>,
) -> Result<Json<Value>, ServerError> {
    if body.amount <= 0 {
        return Err(ServerError::BadRequest(
            "amount must be positive".to_owned(),
        ));
    }

    if !state.store.top_up(id, body.amount).await? {
        return Err(ServerError::NotFound(format!("principal {id} not found")));
    }
    let principal = state
        .store
        .get_principal(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("principal {id} not found")))?;
    info!(principal = id, amount = body.amount, "balance topped up");

    Ok(Json(json!({
        "id": principal.id,
        "balance": principal.balance,
    })))
}
