//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! **Security note:** internal errors (engine store failures, database
//! errors) are logged with full detail but only a generic message is
//! returned to the caller so that file paths, SQL, or provider internals
//! never leak to clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_core::CoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the courier-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration engine's submission path.
    #[error("engine error: {0}")]
    Core(#[from] CoreError),

    /// Propagated from the SQLite (or other) store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or unknown API key.
    #[error("unauthorised")]
    Unauthorized,

    /// The named provider has no stream transport configured.
    #[error("stream transport unavailable: {0}")]
    StreamUnavailable(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            // Client-facing errors: expose the message directly.
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorised".to_owned()),
            ServerError::StreamUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),

            // Engine errors: submission-time rejections are client-facing,
            // everything else is internal.
            ServerError::Core(e) => match e {
                CoreError::Input(m) => (StatusCode::BAD_REQUEST, m.clone()),
                CoreError::InsufficientPoints { required, balance } => (
                    StatusCode::PAYMENT_REQUIRED,
                    format!("insufficient points: required {required}, balance {balance}"),
                ),
                CoreError::Credential(e) => {
                    error!(error = %e, "credential refresh failed");
                    (
                        StatusCode::BAD_GATEWAY,
                        "failed to obtain provider token".to_owned(),
                    )
                }
                other => {
                    error!(error = %other, "engine error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },

            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        // Log the full error chain before discarding it so that diagnostic
        // detail is preserved in the server logs even though clients only
        // see a generic message.
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
