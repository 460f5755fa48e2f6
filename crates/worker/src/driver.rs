//! Queue lifecycle driver.
//!
//! One invocation = one bounded batch:
//!
//! 1. `pending → processing` on first touch
//! 2. fetch up to `batch_size` due, queued sends (empty → `completed`)
//! 3. deliver them sequentially
//! 4. if due sends remain, schedule a continuation at `chain_depth + 1`;
//!    otherwise mark the queue `completed`
//!
//! A completed queue that has due sends again is reopened before its batch.
//! A batch where every attempt failed, or where a claim hit a storage error,
//! delays its continuation by `failure_backoff`.
//!
//! Chains stop at `max_chain_length`. Past that the queue stays
//! `processing` and needs a manual re-trigger.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use cadence_common::config::AppConfig;
use cadence_common::error::AppError;
use cadence_common::types::QueueStatus;
use cadence_mailer::{EmailProvider, ResendClient};

use crate::continuation::{Continuation, ContinuationQueue, RedisContinuationQueue};
use crate::credits::{CreditLedger, PgCreditLedger};
use crate::delivery::{BatchReport, Deliverer};
use crate::settings::WorkerSettings;
use crate::store::{PgSendStore, SendStore};

/// Input of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub queue_id: Uuid,
    /// 0 for an externally triggered invocation.
    pub chain_depth: u32,
}

impl InvocationRequest {
    pub fn new(queue_id: Uuid) -> Self {
        Self {
            queue_id,
            chain_depth: 0,
        }
    }
}

/// What one invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationOutcome {
    pub queue_id: Uuid,
    pub chain_depth: u32,
    #[serde(flatten)]
    pub report: BatchReport,
    /// The queue ended this invocation in `completed`.
    pub completed: bool,
    /// Follow-up scheduled by this invocation.
    pub continuation: Option<Continuation>,
    /// Work remained but the chain limit prevented a continuation.
    pub chain_limit_reached: bool,
}

impl InvocationOutcome {
    pub fn processed(&self) -> u32 {
        self.report.processed()
    }

    fn new(request: InvocationRequest, report: BatchReport) -> Self {
        Self {
            queue_id: request.queue_id,
            chain_depth: request.chain_depth,
            report,
            completed: false,
            continuation: None,
            chain_limit_reached: false,
        }
    }
}

/// Drives queues through their lifecycle one batch per invocation.
pub struct QueueDriver {
    store: Arc<dyn SendStore>,
    deliverer: Deliverer,
    continuations: Arc<dyn ContinuationQueue>,
    settings: Arc<WorkerSettings>,
}

impl QueueDriver {
    pub fn new(
        store: Arc<dyn SendStore>,
        provider: Arc<dyn EmailProvider>,
        credits: Arc<dyn CreditLedger>,
        continuations: Arc<dyn ContinuationQueue>,
        settings: WorkerSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let deliverer = Deliverer::new(store.clone(), provider, credits, settings.clone());
        Self {
            store,
            deliverer,
            continuations,
            settings,
        }
    }

    /// Production wiring: Postgres store and ledger, Resend, Redis continuations.
    pub fn from_config(
        pool: PgPool,
        redis: ConnectionManager,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let settings = WorkerSettings::from_config(config)?;
        let provider = ResendClient::new(
            config.resend_api_url.clone(),
            config.require_resend_api_key()?,
            Duration::from_secs(config.provider_timeout_secs),
        )?;

        if settings.default_from.is_none() {
            tracing::warn!("EMAIL_FROM is not set; queues without from_email will fail to send");
        }

        Ok(Self::new(
            Arc::new(PgSendStore::new(pool.clone())),
            Arc::new(provider),
            Arc::new(PgCreditLedger::new(pool)),
            Arc::new(RedisContinuationQueue::new(redis)),
            settings,
        ))
    }

    pub fn store(&self) -> &Arc<dyn SendStore> {
        &self.store
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run one invocation for a queue.
    ///
    /// Storage errors while loading the queue, fetching the batch or
    /// scheduling the continuation are fatal and returned. Per-send errors
    /// never are.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutcome, AppError> {
        let queue_id = request.queue_id;
        let queue = self
            .store
            .get_queue(queue_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue {} not found", queue_id)))?;

        let now = Utc::now();
        self.store.mark_queue_processing(queue_id, now).await?;

        let batch = self
            .store
            .fetch_due_batch(queue_id, now, self.settings.batch_size)
            .await?;

        if batch.is_empty() {
            self.store.mark_queue_completed(queue_id, Utc::now()).await?;
            tracing::info!(
                queue_id = %queue_id,
                chain_depth = request.chain_depth,
                "No due sends left, queue completed"
            );
            let mut outcome = InvocationOutcome::new(request, BatchReport::default());
            outcome.completed = true;
            return Ok(outcome);
        }

        // New due work on a finished queue (e.g. requeued or backfilled sends).
        if queue.status == QueueStatus::Completed && self.store.reopen_queue(queue_id).await? {
            tracing::info!(queue_id = %queue_id, "Due sends found, completed queue reopened");
        }

        tracing::info!(
            queue_id = %queue_id,
            chain_depth = request.chain_depth,
            batch_size = batch.len(),
            "Processing batch"
        );

        let report = self.deliverer.deliver_batch(&queue, &batch).await;
        let mut outcome = InvocationOutcome::new(request, report);

        let remaining = self.store.count_due(queue_id, Utc::now()).await?;
        if remaining == 0 {
            self.store.mark_queue_completed(queue_id, Utc::now()).await?;
            outcome.completed = true;
            tracing::info!(
                queue_id = %queue_id,
                sent = report.sent,
                failed = report.failed,
                "Batch finished, queue completed"
            );
            return Ok(outcome);
        }

        let next_depth = request.chain_depth.saturating_add(1);
        if next_depth > self.settings.max_chain_length {
            outcome.chain_limit_reached = true;
            tracing::warn!(
                queue_id = %queue_id,
                chain_depth = request.chain_depth,
                remaining,
                max_chain_length = self.settings.max_chain_length,
                "Chain limit reached, not scheduling a continuation"
            );
            return Ok(outcome);
        }

        let delay = if report.needs_backoff() {
            self.settings.failure_backoff
        } else {
            Duration::ZERO
        };
        let continuation = Continuation {
            queue_id,
            chain_depth: next_depth,
            not_before: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        self.continuations.schedule(&continuation).await?;

        tracing::info!(
            queue_id = %queue_id,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            deferred = report.deferred,
            remaining,
            next_depth,
            backoff_ms = delay.as_millis() as u64,
            "Batch finished, continuation scheduled"
        );

        outcome.continuation = Some(continuation);
        Ok(outcome)
    }
}
