//! Fails sends stranded in `sending` by a crashed or timed-out invocation.
//!
//! A claimed send that never got its outcome recorded would otherwise sit in
//! `sending` forever: it is no longer `queued`, so no invocation picks it up.
//! Whether the provider accepted it is unknown, so it is marked `failed`
//! rather than re-queued; an operator can re-queue it explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cadence_common::error::AppError;

use crate::store::SendStore;

pub const INTERRUPTED_ERROR: &str = "delivery interrupted";

pub struct StaleClaimReaper {
    store: Arc<dyn SendStore>,
    timeout: Duration,
    interval: Duration,
}

impl StaleClaimReaper {
    pub fn new(store: Arc<dyn SendStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            interval: (timeout / 4).max(Duration::from_secs(1)),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Stale claim reaper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reap_once(Utc::now()).await {
                tracing::error!(error = %e, "Stale claim sweep failed");
            }
        }
    }

    /// Fail every send claimed more than `timeout` before `now`.
    /// Returns how many were failed.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| AppError::Config(format!("Stale claim timeout out of range: {}", e)))?;

        let reaped = self
            .store
            .fail_stale_claims(now - timeout, INTERRUPTED_ERROR, now)
            .await?;
        if reaped.is_empty() {
            return Ok(0);
        }

        let mut per_queue: HashMap<Uuid, usize> = HashMap::new();
        for send in &reaped {
            match send.queue_id() {
                Some(queue_id) => *per_queue.entry(queue_id).or_default() += 1,
                None => tracing::warn!(send_id = %send.id, "Reaped send has no queue tag"),
            }
        }

        // The sends are already failed; a lost increment only skews the counter.
        for (queue_id, count) in per_queue {
            let mut counted = 0;
            for _ in 0..count {
                match self.store.increment_failed(queue_id).await {
                    Ok(()) => counted += 1,
                    Err(e) => tracing::error!(
                        queue_id = %queue_id,
                        error = %e,
                        "Failed to increment failed counter for reaped send"
                    ),
                }
            }
            tracing::warn!(queue_id = %queue_id, count, counted, "Failed stale sending claims");
        }

        Ok(reaped.len())
    }
}
