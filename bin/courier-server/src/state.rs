//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use courier_core::{CredentialCache, JobOrchestrator};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::providers::token::HttpTokenSource;

/// State shared across all HTTP handlers.
///
/// The SQLite store backs both the task records and the prepaid ledger, so
/// the orchestrator is parameterised with it twice.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Task records + principals + ledger.
    pub store: Arc<SqliteStore>,
    /// The submit/poll/bill engine.
    pub orchestrator: JobOrchestrator<SqliteStore, SqliteStore>,
    /// Short-lived provider tokens with single-flight refresh.
    pub credentials: CredentialCache<HttpTokenSource>,
    /// Generic JSON-over-HTTP provider adapter.
    pub provider: Arc<crate::providers::http::HttpProvider>,
}
