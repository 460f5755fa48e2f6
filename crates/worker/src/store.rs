//! Queue and send persistence.
//!
//! [`SendStore`] is the only way the worker touches queue and send rows.
//! Status transitions are conditional updates on the current status, so two
//! overlapping invocations for the same queue never both deliver one send,
//! and counters are bumped with `col = col + 1` so concurrent increments are
//! never lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use cadence_common::error::AppError;
use cadence_common::types::{CampaignEmail, EmailSend, SendQueue, SendStatus};

#[async_trait]
pub trait SendStore: Send + Sync {
    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<SendQueue>, AppError>;

    /// `pending → processing`, stamping `started_at` once. No-op otherwise.
    async fn mark_queue_processing(&self, queue_id: Uuid, now: DateTime<Utc>)
    -> Result<(), AppError>;

    /// Move the queue to `completed`. No-op if it already is.
    async fn mark_queue_completed(&self, queue_id: Uuid, now: DateTime<Utc>)
    -> Result<(), AppError>;

    /// Up to `limit` queued sends tagged with `queue_id` and due at `now`,
    /// oldest first.
    async fn fetch_due_batch(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EmailSend>, AppError>;

    /// Number of queued sends tagged with `queue_id` and due at `now`.
    async fn count_due(&self, queue_id: Uuid, now: DateTime<Utc>) -> Result<u64, AppError>;

    /// Atomically move a send `queued → sending`. Returns `false` when the
    /// send was no longer queued (another invocation claimed it).
    async fn claim_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    async fn load_template(
        &self,
        campaign_id: Uuid,
        sequence_step: i32,
    ) -> Result<Option<CampaignEmail>, AppError>;

    /// `sending → sent` with the provider's message id. Returns `false` when
    /// the send was no longer `sending` (e.g. the reaper failed it).
    async fn mark_sent(
        &self,
        send_id: Uuid,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// `sending → failed` with an error message. Returns `false` when the send
    /// was no longer `sending`.
    async fn mark_failed(
        &self,
        send_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn increment_sent(&self, queue_id: Uuid) -> Result<(), AppError>;

    async fn increment_failed(&self, queue_id: Uuid) -> Result<(), AppError>;

    /// Fail every send stuck in `sending` since before `claimed_before`.
    /// Returns the sends that were failed.
    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailSend>, AppError>;

    async fn get_send(&self, send_id: Uuid) -> Result<Option<EmailSend>, AppError>;

    /// Sends of a queue, oldest first, optionally filtered by status.
    async fn list_sends(
        &self,
        queue_id: Uuid,
        status: Option<SendStatus>,
    ) -> Result<Vec<EmailSend>, AppError>;

    /// Manual recovery: `failed → queued`, clearing the error. Returns
    /// `false` when the send was not failed.
    async fn requeue_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// `completed → processing` so a re-queued send is picked up again.
    /// Returns `false` when the queue was not completed.
    async fn reopen_queue(&self, queue_id: Uuid) -> Result<bool, AppError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgSendStore {
    pool: PgPool,
}

impl PgSendStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendStore for PgSendStore {
    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<SendQueue>, AppError> {
        let queue: Option<SendQueue> = sqlx::query_as("SELECT * FROM send_queues WHERE id = $1")
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(queue)
    }

    async fn mark_queue_processing(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE send_queues
            SET status = 'processing', started_at = COALESCE(started_at, $2)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(queue_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_queue_completed(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE send_queues
            SET status = 'completed', completed_at = $2
            WHERE id = $1 AND status <> 'completed'
            "#,
        )
        .bind(queue_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_due_batch(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EmailSend>, AppError> {
        let sends: Vec<EmailSend> = sqlx::query_as(
            r#"
            SELECT *
            FROM email_sends
            WHERE metadata->>'queue_id' = $1
              AND status = 'queued'
              AND scheduled_at <= $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(queue_id.to_string())
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(sends)
    }

    async fn count_due(&self, queue_id: Uuid, now: DateTime<Utc>) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM email_sends
            WHERE metadata->>'queue_id' = $1
              AND status = 'queued'
              AND scheduled_at <= $2
            "#,
        )
        .bind(queue_id.to_string())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn claim_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE email_sends
            SET status = 'sending', updated_at = $2
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(send_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn load_template(
        &self,
        campaign_id: Uuid,
        sequence_step: i32,
    ) -> Result<Option<CampaignEmail>, AppError> {
        let template: Option<CampaignEmail> = sqlx::query_as(
            r#"
            SELECT campaign_id, sequence_step, subject, body_html
            FROM campaign_emails
            WHERE campaign_id = $1 AND sequence_step = $2
            "#,
        )
        .bind(campaign_id)
        .bind(sequence_step)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }

    async fn mark_sent(
        &self,
        send_id: Uuid,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE email_sends
            SET status = 'sent', provider_message_id = $2, sent_at = $3,
                error_message = NULL, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(send_id)
        .bind(provider_message_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        send_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE email_sends
            SET status = 'failed', error_message = $2, updated_at = $3
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(send_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_sent(&self, queue_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE send_queues SET emails_sent = emails_sent + 1 WHERE id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn increment_failed(&self, queue_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE send_queues SET emails_failed = emails_failed + 1 WHERE id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailSend>, AppError> {
        let sends: Vec<EmailSend> = sqlx::query_as(
            r#"
            UPDATE email_sends
            SET status = 'failed', error_message = $2, updated_at = $3
            WHERE status = 'sending' AND updated_at < $1
            RETURNING *
            "#,
        )
        .bind(claimed_before)
        .bind(error)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(sends)
    }

    async fn get_send(&self, send_id: Uuid) -> Result<Option<EmailSend>, AppError> {
        let send: Option<EmailSend> = sqlx::query_as("SELECT * FROM email_sends WHERE id = $1")
            .bind(send_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(send)
    }

    async fn list_sends(
        &self,
        queue_id: Uuid,
        status: Option<SendStatus>,
    ) -> Result<Vec<EmailSend>, AppError> {
        let sends: Vec<EmailSend> = sqlx::query_as(
            r#"
            SELECT *
            FROM email_sends
            WHERE metadata->>'queue_id' = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(queue_id.to_string())
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;

        Ok(sends)
    }

    async fn requeue_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE email_sends
            SET status = 'queued', error_message = NULL, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(send_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() == 1;
        if requeued {
            tracing::info!(send_id = %send_id, "Send re-queued");
        }

        Ok(requeued)
    }

    async fn reopen_queue(&self, queue_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE send_queues
            SET status = 'processing', completed_at = NULL
            WHERE id = $1 AND status = 'completed'
            "#,
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
