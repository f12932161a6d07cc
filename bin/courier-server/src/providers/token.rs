//! Signed-assertion token exchange.
//!
//! Builds a short-lived HMAC-SHA256-signed assertion naming the principal
//! and scope, exchanges it at the provider's token endpoint, and returns the
//! issued token with its validity window. Deduplication of concurrent
//! fetches is the credential cache's job, not this adapter's.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use courier_core::{CoreError, IssuedToken, PrincipalId, TokenSource};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::Sha256;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// Validity window claimed by the assertion itself.
const ASSERTION_TTL_SECS: i64 = 300;

/// Fallback validity when the token endpoint reports no `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 600;

pub struct HttpTokenSource {
    client: Client,
    token_url: String,
    secret: String,
}

impl HttpTokenSource {
    pub fn new(cfg: &Config) -> Self {
        let client = Client::builder()
            .user_agent(concat!("courier-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token_url: cfg.token_url.clone(),
            secret: cfg.token_secret.clone(),
        }
    }

    /// `base64url(claims).base64url(hmac-sha256(secret, base64url(claims)))`
    fn sign_assertion(&self, principal: PrincipalId, scope: &str) -> Result<String, CoreError> {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": principal,
            "scope": scope,
            "iat": now,
            "exp": now + ASSERTION_TTL_SECS,
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| CoreError::Credential(format!("invalid signing secret: {e}")))?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }
}

impl TokenSource for HttpTokenSource {
    async fn fetch(&self, principal: PrincipalId, scope: &str) -> Result<IssuedToken, CoreError> {
        let assertion = self.sign_assertion(principal, scope)?;
        let resp = self
            .client
            .post(&self.token_url)
            .json(&json!({
                "grant_type": "assertion",
                "assertion": assertion,
            }))
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Credential(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Credential("token response is missing token".to_owned()))?;
        let ttl = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        Ok(IssuedToken {
            token: token.to_owned(),
            ttl: Duration::from_secs(ttl),
        })
    }
}
