//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// Runtime configuration for courier-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite (or other) database URL (default: `"sqlite://courier.db"`).
    /// Supports any sqlx-compatible connection string.
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origin allowlist; `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// Base URL of the JSON-over-HTTP job provider.
    pub provider_url: String,

    /// Bearer key sent with provider calls, if the provider requires one.
    pub provider_api_key: Option<String>,

    /// WebSocket URL of the provider's duplex stream transport. Streaming
    /// and batch submissions return 503 when unset.
    pub provider_stream_url: Option<String>,

    /// Endpoint exchanging a signed assertion for a short-lived token.
    pub token_url: String,

    /// Shared secret signing the assertion.
    pub token_secret: String,

    /// Points charged per input character when the caller gives no
    /// estimate; jobs without text input are estimated at one flat unit.
    pub unit_price: i64,

    /// Delay between consecutive status polls.
    pub poll_interval: Duration,

    /// Status polls before a job is failed with a timeout.
    pub poll_max_retries: u32,

    /// Hard ceiling on one duplex stream run.
    pub stream_timeout: Duration,

    /// Concurrent items per batch submission.
    pub batch_concurrency: usize,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("COURIER_BIND", "0.0.0.0:3000"),
            database_url: env_or("COURIER_DATABASE_URL", "sqlite://courier.db"),
            log_level: env_or("COURIER_LOG", "info"),
            log_json: std::env::var("COURIER_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("COURIER_CORS_ORIGINS").ok(),
            provider_url: env_or("COURIER_PROVIDER_URL", "http://127.0.0.1:9700"),
            provider_api_key: std::env::var("COURIER_PROVIDER_API_KEY").ok(),
            provider_stream_url: std::env::var("COURIER_PROVIDER_STREAM_URL").ok(),
            token_url: env_or("COURIER_TOKEN_URL", "http://127.0.0.1:9700/oauth/token"),
            token_secret: env_or("COURIER_TOKEN_SECRET", "dev-secret"),
            unit_price: parse_env("COURIER_UNIT_PRICE", 1),
            poll_interval: Duration::from_millis(parse_env("COURIER_POLL_INTERVAL_MS", 3000)),
            poll_max_retries: parse_env("COURIER_POLL_MAX_RETRIES", 100),
            stream_timeout: Duration::from_secs(parse_env("COURIER_STREAM_TIMEOUT_SECS", 120)),
            batch_concurrency: parse_env("COURIER_BATCH_CONCURRENCY", 3),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
