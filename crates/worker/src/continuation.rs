//! Continuation queue: how a queue drain carries on after one invocation.
//!
//! Each invocation handles a single bounded batch. When due work remains the
//! driver schedules a [`Continuation`]; the worker binary's
//! [`ContinuationConsumer`] picks due continuations up and invokes the driver
//! again. Chains end when a queue completes or the chain-length limit trips.
//!
//! The Redis implementation keeps continuations in a sorted set scored by
//! their `not_before` timestamp (ms). `ZREM` decides ownership: only the
//! consumer whose `ZREM` removed the member runs it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_common::error::AppError;

use crate::driver::{InvocationOutcome, InvocationRequest, QueueDriver};

/// Sorted-set key holding pending continuations.
pub const DEFAULT_CONTINUATION_KEY: &str = "send_queue:continuations";

/// A follow-up invocation for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub queue_id: Uuid,
    /// Depth of the invocation this continuation will start.
    pub chain_depth: u32,
    /// Earliest time the continuation may run.
    pub not_before: DateTime<Utc>,
}

impl From<&Continuation> for InvocationRequest {
    fn from(c: &Continuation) -> Self {
        InvocationRequest {
            queue_id: c.queue_id,
            chain_depth: c.chain_depth,
        }
    }
}

#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    async fn schedule(&self, continuation: &Continuation) -> Result<(), AppError>;

    /// Remove and return the earliest continuation due at `now`, if any.
    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<Continuation>, AppError>;
}

/// Redis sorted-set continuation queue.
#[derive(Clone)]
pub struct RedisContinuationQueue {
    redis: ConnectionManager,
    key: String,
}

impl RedisContinuationQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_key(redis, DEFAULT_CONTINUATION_KEY)
    }

    pub fn with_key(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }
}

#[async_trait]
impl ContinuationQueue for RedisContinuationQueue {
    async fn schedule(&self, continuation: &Continuation) -> Result<(), AppError> {
        let member = serde_json::to_string(continuation)
            .map_err(|e| AppError::Internal(format!("Failed to encode continuation: {}", e)))?;
        let score = continuation.not_before.timestamp_millis();

        let mut redis = self.redis.clone();
        redis.zadd::<_, _, _, ()>(&self.key, member, score).await?;

        tracing::debug!(
            queue_id = %continuation.queue_id,
            chain_depth = continuation.chain_depth,
            not_before = %continuation.not_before,
            "Continuation scheduled"
        );
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<Continuation>, AppError> {
        let mut redis = self.redis.clone();

        // ZRANGEBYSCORE key -inf now LIMIT 0 1
        let candidates: Vec<String> = redis
            .zrangebyscore_limit(&self.key, "-inf", now.timestamp_millis(), 0, 1)
            .await?;

        let Some(member) = candidates.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may have taken it between the read and here.
        let removed: i64 = redis.zrem(&self.key, &member).await?;
        if removed == 0 {
            return Ok(None);
        }

        match serde_json::from_str::<Continuation>(&member) {
            Ok(continuation) => Ok(Some(continuation)),
            Err(e) => {
                tracing::error!(error = %e, member = %member, "Dropping undecodable continuation");
                Ok(None)
            }
        }
    }
}

/// Vec-backed continuation queue for tests.
#[derive(Default)]
pub struct InMemoryContinuationQueue {
    pending: Mutex<Vec<Continuation>>,
}

impl InMemoryContinuationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything still pending.
    pub fn pending(&self) -> Vec<Continuation> {
        self.pending
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContinuationQueue for InMemoryContinuationQueue {
    async fn schedule(&self, continuation: &Continuation) -> Result<(), AppError> {
        self.pending
            .lock()
            .map_err(|_| AppError::Internal("continuation queue lock poisoned".to_string()))?
            .push(continuation.clone());
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<Continuation>, AppError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AppError::Internal("continuation queue lock poisoned".to_string()))?;

        let next = pending
            .iter()
            .enumerate()
            .filter(|(_, c)| c.not_before <= now)
            .min_by_key(|(_, c)| c.not_before)
            .map(|(idx, _)| idx);

        Ok(next.map(|idx| pending.remove(idx)))
    }
}

/// What a single consumer poll did.
#[derive(Debug)]
pub enum PollResult {
    /// Nothing was due.
    Idle,
    /// A continuation ran to completion.
    Invoked(InvocationOutcome),
    /// A continuation was claimed but the invocation failed. It is not retried.
    Failed { queue_id: Uuid },
}

/// Polls the continuation queue and runs the driver for each due entry.
pub struct ContinuationConsumer {
    queue: Arc<dyn ContinuationQueue>,
    driver: Arc<QueueDriver>,
    poll_interval: Duration,
}

impl ContinuationConsumer {
    pub fn new(
        queue: Arc<dyn ContinuationQueue>,
        driver: Arc<QueueDriver>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            driver,
            poll_interval,
        }
    }

    /// Run until the task is cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Continuation consumer started"
        );

        loop {
            match self.poll_once(Utc::now()).await {
                // Drain back-to-back while work is due.
                Ok(PollResult::Invoked(_)) | Ok(PollResult::Failed { .. }) => continue,
                Ok(PollResult::Idle) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Continuation queue poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Pop one continuation due at `now` and invoke the driver for it.
    ///
    /// Only queue errors are returned; driver errors are logged and reported
    /// as [`PollResult::Failed`] so the loop keeps draining.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollResult, AppError> {
        let Some(continuation) = self.queue.pop_due(now).await? else {
            return Ok(PollResult::Idle);
        };

        match self.driver.invoke(InvocationRequest::from(&continuation)).await {
            Ok(outcome) => Ok(PollResult::Invoked(outcome)),
            Err(e) => {
                tracing::error!(
                    queue_id = %continuation.queue_id,
                    chain_depth = continuation.chain_depth,
                    error = %e,
                    "Continuation invocation failed"
                );
                Ok(PollResult::Failed {
                    queue_id: continuation.queue_id,
                })
            }
        }
    }
}
