//! Bearer-key authentication.
//!
//! `require_principal` resolves the presented API key to a principal row and
//! injects it into the request extensions; handlers read it back with
//! `Extension<Principal>`. Admin routes are guarded separately by a static
//! token from the environment.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::db::PrincipalStore;
use crate::state::AppState;

fn bearer(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn unauthorised() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": "unauthorised" })),
    )
        .into_response()
}

/// Resolve the calling principal or reject with 401.
pub async fn require_principal(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = bearer(&req) else {
        return unauthorised();
    };

    match state.store.find_by_api_key(key).await {
        Ok(Some(principal)) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Ok(None) => unauthorised(),
        Err(e) => {
            warn!(error = %e, "failed to resolve api key");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

/// Guard admin routes with the `COURIER_ADMIN_TOKEN` bearer token.
/// When the variable is unset the routes are open (development mode).
pub async fn check_admin_auth(req: Request<Body>, next: Next) -> Response {
    if let Ok(expected) = std::env::var("COURIER_ADMIN_TOKEN") {
        match bearer(&req) {
            Some(token) if token == expected => {}
            _ => return unauthorised(),
        }
    }
    next.run(req).await
}
