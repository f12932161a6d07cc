//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Health / heartbeat route
//! - Authenticated `/v1` job, task, and token routes
//! - `/admin` provisioning routes (optionally protected by bearer token)

mod admin;
mod health;
mod jobs;
mod tasks;
mod token;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;

use crate::middleware::{auth, cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .merge(jobs::router())
        .merge(tasks::router())
        .merge(token::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_principal,
        ));

    Router::new()
        .merge(health::router())
        .nest("/v1", v1)
        .nest("/admin", admin::router())
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
