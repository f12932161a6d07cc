//! Provider credential endpoint.

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::db::Principal;
use crate::error::ServerError;
use crate::state::AppState;

/// Register token routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/token", get(get_token))
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub scope: Option<String>,
}

/// Fetch a short-lived provider token (`GET /v1/token?scope=...`).
///
/// Served from the credential cache; concurrent callers for the same scope
/// share one refresh.
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<Value>, ServerError> {
    let scope = q
        .scope
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("scope query parameter is required".to_owned()))?;

    let token = state.credentials.get(principal.id, &scope).await?;
    Ok(Json(json!({ "token": token, "scope": scope })))
}
