//! Database abstraction layer.
//!
//! The engine's [`courier_core::TaskStore`] and [`courier_core::ResourceLedger`]
//! traits are implemented by [`sqlite::SqliteStore`]; [`PrincipalStore`] adds
//! the server-side principal rows backing authentication and the prepaid
//! ledger. To swap to another database (Postgres, MySQL, ...), implement the
//! traits for a new type and change the concrete type in
//! [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures (stable since Rust
//! 1.75) so no extra `async-trait` crate is required.

pub mod sqlite;

use chrono::{DateTime, Utc};

/// A single row in the `principals` table.
///
/// The row is both the API credential (`api_key`) and the prepaid ledger
/// account (`balance`).
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: i64,
    /// Unique bearer key identifying the principal on API calls.
    pub api_key: String,
    /// Prepaid point balance.
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Trait for provisioning and resolving principals.
pub trait PrincipalStore: Send + Sync + 'static {
    /// Insert a principal with the given key and starting balance.
    fn create_principal(
        &self,
        api_key: &str,
        balance: i64,
    ) -> impl std::future::Future<Output = Result<Principal, sqlx::Error>> + Send;

    /// Resolve the principal presenting `api_key`, if any.
    fn find_by_api_key(
        &self,
        api_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Principal>, sqlx::Error>> + Send;

    fn get_principal(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<Option<Principal>, sqlx::Error>> + Send;

    /// Add `amount` points. Returns `false` when the principal is unknown.
    fn top_up(
        &self,
        id: i64,
        amount: i64,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;
}
