//! Prepaid resource ledger abstraction.
//!
//! The ledger gates job admission (`is_affordable` with a pre-estimate) and
//! bills completed work (`deduct` with the provider-reported actual cost).
//! The check-then-deduct sequence is intentionally not transactional: the
//! balance may change between the two calls, and a deduction failure after a
//! successful job is logged but never rolls the record back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::types::{CoreError, PrincipalId};

/// Result of an affordability pre-check.
#[derive(Debug, Clone, Copy)]
pub struct Affordability {
    pub ok: bool,
    /// Balance observed at check time.
    pub balance: i64,
}

/// Trait for the prepaid balance backing job execution.
pub trait ResourceLedger: Send + Sync + 'static {
    /// Check whether `principal` can afford `amount` points.
    fn is_affordable(
        &self,
        principal: PrincipalId,
        amount: i64,
    ) -> impl std::future::Future<Output = Result<Affordability, CoreError>> + Send;

    /// Deduct `amount` points. Returns `false` when the balance no longer
    /// covers the amount (the write must never drive a balance negative).
    fn deduct(
        &self,
        principal: PrincipalId,
        amount: i64,
    ) -> impl std::future::Future<Output = Result<bool, CoreError>> + Send;
}

/// In-memory [`ResourceLedger`] used by tests and embedded deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    balances: Arc<Mutex<HashMap<PrincipalId, i64>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` points to a principal's balance.
    pub async fn credit(&self, principal: PrincipalId, amount: i64) {
        let mut balances = self.balances.lock().await;
        *balances.entry(principal).or_insert(0) += amount;
    }

    pub async fn balance(&self, principal: PrincipalId) -> i64 {
        *self.balances.lock().await.get(&principal).unwrap_or(&0)
    }
}

impl ResourceLedger for MemoryLedger {
    async fn is_affordable(
        &self,
        principal: PrincipalId,
        amount: i64,
    ) -> Result<Affordability, CoreError> {
        let balance = self.balance(principal).await;
        Ok(Affordability {
            ok: balance >= amount,
            balance,
        })
    }

    async fn deduct(&self, principal: PrincipalId, amount: i64) -> Result<bool, CoreError> {
        let mut balances = self.balances.lock().await;
        let balance = balances.entry(principal).or_insert(0);
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }
}
