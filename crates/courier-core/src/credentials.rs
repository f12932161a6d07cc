//! Per-principal, per-scope cache of short-lived provider tokens.
//!
//! A fresh token (more than `refresh_threshold` of validity left) is served
//! straight from the map with no I/O. When a refresh is needed, exactly one
//! caller performs it per key; everyone else awaits the same per-key `watch`
//! channel and observes the same token or the same error. A failed refresh
//! leaves any previously cached token in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::provider::TokenSource;
use crate::types::{CoreError, PrincipalId};

/// Tuning for the cache.
#[derive(Debug, Clone)]
pub struct CredentialOptions {
    /// Tokens with less than this much validity left are refreshed.
    pub refresh_threshold: Duration,
    /// Immediate retries of a failed refresh before surfacing the error.
    pub max_retries: u32,
    /// Fixed delay between refresh retries.
    pub retry_delay: Duration,
    /// Period of the background sweep evicting expired entries.
    pub sweep_interval: Duration,
}

impl Default for CredentialOptions {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

type Key = (PrincipalId, String);

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    expiry: Instant,
}

/// Either the settled refresh result or `None` while still in flight.
type RefreshSlot = Option<Result<String, CoreError>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<Key, Entry>,
    /// At most one in-flight refresh per key.
    in_flight: HashMap<Key, watch::Receiver<RefreshSlot>>,
}

/// Shared token cache with single-flight refresh.
///
/// Process-wide shared state: clone the handle freely, all clones observe
/// the same map.
pub struct CredentialCache<T> {
    source: Arc<T>,
    opts: CredentialOptions,
    state: Arc<Mutex<CacheState>>,
}

impl<T> Clone for CredentialCache<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            opts: self.opts.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: TokenSource> CredentialCache<T> {
    pub fn new(source: Arc<T>, opts: CredentialOptions) -> Self {
        Self {
            source,
            opts,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Return a token for `(principal, scope)`, refreshing it if needed.
    pub async fn get(&self, principal: PrincipalId, scope: &str) -> Result<String, CoreError> {
        let key = (principal, scope.to_owned());

        let (tx, mut follower) = {
            let mut state = self.state.lock().await;

            if let Some(entry) = state.entries.get(&key) {
                if entry.expiry > Instant::now() + self.opts.refresh_threshold {
                    return Ok(entry.token.clone());
                }
            }

            match state.in_flight.get(&key) {
                Some(rx) => (None, rx.clone()),
                None => {
                    // This caller leads the refresh for the key.
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(key.clone(), rx.clone());
                    (Some(tx), rx)
                }
            }
        };

        match tx {
            Some(tx) => {
                let result = self.refresh(principal, scope).await;
                {
                    let mut state = self.state.lock().await;
                    state.in_flight.remove(&key);
                    if let Ok(entry) = &result {
                        state.entries.insert(key, entry.clone());
                    }
                    // A failed refresh leaves any previous entry untouched.
                }
                let settled = result.as_ref().map(|e| e.token.clone()).map_err(Clone::clone);
                let _ = tx.send(Some(settled.clone()));
                settled
            }
            None => {
                // Follow the in-flight refresh and share its outcome.
                let slot = follower
                    .wait_for(|slot| slot.is_some())
                    .await
                    .map_err(|_| {
                        CoreError::Credential("refresh abandoned before completion".to_owned())
                    })?;
                slot.clone().unwrap_or_else(|| {
                    Err(CoreError::Credential(
                        "refresh settled without a result".to_owned(),
                    ))
                })
            }
        }
    }

    /// Evict expired entries with no refresh in flight. One sweep pass.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let in_flight: Vec<Key> = state.in_flight.keys().cloned().collect();
        let before = state.entries.len();
        state
            .entries
            .retain(|key, entry| entry.expiry > now || in_flight.contains(key));
        let evicted = before - state.entries.len();
        if evicted > 0 {
            debug!(evicted, "credential sweep evicted expired tokens");
        }
    }

    /// Spawn the periodic eviction sweep. Runs until the handle is aborted
    /// or the process exits.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let period = self.opts.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                cache.sweep_expired().await;
            }
        })
    }

    /// Number of cached entries. Test helper.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Exchange an assertion for a fresh token, with bounded immediate
    /// retries on failure.
    async fn refresh(&self, principal: PrincipalId, scope: &str) -> Result<Entry, CoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.fetch(principal, scope).await {
                Ok(issued) => {
                    debug!(principal, scope, ttl_secs = issued.ttl.as_secs(), "token refreshed");
                    return Ok(Entry {
                        token: issued.token,
                        expiry: Instant::now() + issued.ttl,
                    });
                }
                Err(e) if attempt < self.opts.max_retries => {
                    attempt += 1;
                    warn!(
                        principal,
                        scope,
                        attempt,
                        error = %e,
                        "token refresh failed; retrying"
                    );
                    tokio::time::sleep(self.opts.retry_delay).await;
                }
                Err(e) => {
                    warn!(principal, scope, error = %e, "token refresh exhausted its retries");
                    return Err(CoreError::Credential(e.to_string()));
                }
            }
        }
    }
}
