use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (continuation queue)
    pub redis_url: String,

    /// HS256 secret used to verify API bearer tokens
    pub jwt_secret: String,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Base URL of the Resend-compatible email API
    pub resend_api_url: String,

    /// Default sender address when a queue carries no override
    pub email_from: Option<String>,

    /// Public base URL of the web app, used to build unsubscribe links
    pub app_url: String,

    /// Maximum number of sends fetched per invocation (default: 10)
    pub send_batch_size: u32,

    /// Delay between consecutive sends in a batch, in milliseconds (default: 500)
    pub send_delay_ms: u64,

    /// Maximum number of chained continuations for one queue (default: 1000)
    pub max_chain_length: u32,

    /// Continuation delay after a batch where every send failed, in milliseconds
    pub failure_backoff_ms: u64,

    /// How often the worker polls the continuation queue, in milliseconds
    pub continuation_poll_interval_ms: u64,

    /// Sends stuck in `sending` longer than this are failed by the reaper
    pub stale_claim_timeout_secs: u64,

    /// HTTP timeout for the email provider, in seconds
    pub provider_timeout_secs: u64,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the API server listens on (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_from: std::env::var("EMAIL_FROM").ok(),
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            send_batch_size: parse_var("SEND_BATCH_SIZE", 10)?,
            send_delay_ms: parse_var("SEND_DELAY_MS", 500)?,
            max_chain_length: parse_var("MAX_CHAIN_LENGTH", 1000)?,
            failure_backoff_ms: parse_var("FAILURE_BACKOFF_MS", 30_000)?,
            continuation_poll_interval_ms: parse_var("CONTINUATION_POLL_INTERVAL_MS", 1000)?,
            stale_claim_timeout_secs: parse_var("STALE_CLAIM_TIMEOUT_SECS", 600)?,
            provider_timeout_secs: parse_var("PROVIDER_TIMEOUT_SECS", 15)?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_var("API_PORT", 3000)?,
        })
    }

    /// The Resend API key, or a configuration error if it is unset.
    pub fn require_resend_api_key(&self) -> anyhow::Result<&str> {
        self.resend_api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("RESEND_API_KEY environment variable is required"))
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
