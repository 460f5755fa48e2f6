use std::time::Duration;

use reqwest::Url;

use cadence_common::config::AppConfig;
use cadence_common::error::AppError;

/// Tunables for the send worker, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Maximum sends fetched per invocation.
    pub batch_size: u32,
    /// Pause between consecutive sends in a batch.
    pub send_delay: Duration,
    /// Continuations beyond this depth are not scheduled.
    pub max_chain_length: u32,
    /// Continuation delay after a batch in which every delivery failed.
    pub failure_backoff: Duration,
    /// Sender used when the queue has no `from_email`.
    pub default_from: Option<String>,
    /// Web app base URL; unsubscribe links hang off it.
    pub app_url: Url,
    pub continuation_poll_interval: Duration,
    pub stale_claim_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        if config.send_batch_size == 0 {
            return Err(AppError::Config(
                "SEND_BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            batch_size: config.send_batch_size,
            send_delay: Duration::from_millis(config.send_delay_ms),
            max_chain_length: config.max_chain_length,
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
            default_from: config.email_from.clone(),
            app_url: parse_app_url(&config.app_url)?,
            continuation_poll_interval: Duration::from_millis(config.continuation_poll_interval_ms),
            stale_claim_timeout: Duration::from_secs(config.stale_claim_timeout_secs),
        })
    }
}

/// Parse the app base URL, rejecting URLs that cannot carry a path.
pub fn parse_app_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Config(format!("APP_URL '{}' is not a valid URL: {}", raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(AppError::Config(format!(
            "APP_URL '{}' cannot be used as a base URL",
            raw
        )));
    }
    Ok(url)
}
