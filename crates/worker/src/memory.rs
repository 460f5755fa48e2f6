//! In-memory [`SendStore`] for tests and local dry runs.
//!
//! Mirrors the SQL semantics of [`PgSendStore`](crate::store::PgSendStore):
//! same filters, same FIFO order, same conditional transitions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use cadence_common::error::AppError;
use cadence_common::types::{CampaignEmail, EmailSend, QueueStatus, SendQueue, SendStatus};

use crate::store::SendStore;

#[derive(Default)]
struct State {
    queues: HashMap<Uuid, SendQueue>,
    /// Insertion order doubles as the tiebreaker for equal `created_at`.
    sends: Vec<EmailSend>,
    templates: HashMap<(Uuid, i32), CampaignEmail>,
    /// Upcoming `claim_send` calls that fail with a storage error.
    failing_claims: usize,
    /// Upcoming counter increments that fail with a storage error.
    failing_increments: usize,
}

#[derive(Default)]
pub struct InMemorySendStore {
    state: Mutex<State>,
}

impl InMemorySendStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("in-memory store lock poisoned".to_string()))
    }

    pub fn insert_queue(&self, queue: SendQueue) -> Result<(), AppError> {
        self.lock()?.queues.insert(queue.id, queue);
        Ok(())
    }

    pub fn insert_send(&self, send: EmailSend) -> Result<(), AppError> {
        self.lock()?.sends.push(send);
        Ok(())
    }

    pub fn insert_template(&self, template: CampaignEmail) -> Result<(), AppError> {
        self.lock()?
            .templates
            .insert((template.campaign_id, template.sequence_step), template);
        Ok(())
    }

    /// Snapshot of a send.
    pub fn send(&self, send_id: Uuid) -> Option<EmailSend> {
        let state = self.lock().ok()?;
        state.sends.iter().find(|s| s.id == send_id).cloned()
    }

    /// Snapshot of a queue.
    pub fn queue(&self, queue_id: Uuid) -> Option<SendQueue> {
        let state = self.lock().ok()?;
        state.queues.get(&queue_id).cloned()
    }

    /// Overwrite a send's status directly, bypassing transition rules.
    pub fn set_send_status(&self, send_id: Uuid, status: SendStatus) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let send = state
            .sends
            .iter_mut()
            .find(|s| s.id == send_id)
            .ok_or_else(|| AppError::NotFound(format!("Send {} not found", send_id)))?;
        send.status = status;
        Ok(())
    }

    /// Make the next `count` claims fail as if the database were down.
    pub fn fail_next_claims(&self, count: usize) -> Result<(), AppError> {
        self.lock()?.failing_claims = count;
        Ok(())
    }

    /// Make the next `count` counter increments fail.
    pub fn fail_next_increments(&self, count: usize) -> Result<(), AppError> {
        self.lock()?.failing_increments = count;
        Ok(())
    }

    fn take_failure(slot: &mut usize, what: &str) -> Result<(), AppError> {
        if *slot > 0 {
            *slot -= 1;
            return Err(AppError::Internal(format!("simulated {} failure", what)));
        }
        Ok(())
    }

    fn due<'a>(
        sends: &'a [EmailSend],
        queue_id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a EmailSend> {
        sends.iter().filter(move |s| {
            s.queue_id() == Some(queue_id)
                && s.status == SendStatus::Queued
                && s.scheduled_at <= now
        })
    }

    /// Apply `update` to the send if its status is `from`.
    fn transition(
        &self,
        send_id: Uuid,
        from: SendStatus,
        update: impl FnOnce(&mut EmailSend),
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state
            .sends
            .iter_mut()
            .find(|s| s.id == send_id && s.status == from)
        {
            Some(send) => {
                update(send);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SendStore for InMemorySendStore {
    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<SendQueue>, AppError> {
        Ok(self.lock()?.queues.get(&queue_id).cloned())
    }

    async fn mark_queue_processing(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(queue) = state.queues.get_mut(&queue_id)
            && queue.status == QueueStatus::Pending
        {
            queue.status = QueueStatus::Processing;
            queue.started_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn mark_queue_completed(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(queue) = state.queues.get_mut(&queue_id)
            && queue.status != QueueStatus::Completed
        {
            queue.status = QueueStatus::Completed;
            queue.completed_at = Some(now);
        }
        Ok(())
    }

    async fn fetch_due_batch(
        &self,
        queue_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EmailSend>, AppError> {
        let state = self.lock()?;
        let mut due: Vec<&EmailSend> = Self::due(&state.sends, queue_id, now).collect();
        // Stable sort keeps insertion order for equal timestamps.
        due.sort_by_key(|s| s.created_at);
        Ok(due.into_iter().take(limit as usize).cloned().collect())
    }

    async fn count_due(&self, queue_id: Uuid, now: DateTime<Utc>) -> Result<u64, AppError> {
        let state = self.lock()?;
        Ok(Self::due(&state.sends, queue_id, now).count() as u64)
    }

    async fn claim_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        Self::take_failure(&mut self.lock()?.failing_claims, "claim")?;
        self.transition(send_id, SendStatus::Queued, |send| {
            send.status = SendStatus::Sending;
            send.updated_at = now;
        })
    }

    async fn load_template(
        &self,
        campaign_id: Uuid,
        sequence_step: i32,
    ) -> Result<Option<CampaignEmail>, AppError> {
        Ok(self
            .lock()?
            .templates
            .get(&(campaign_id, sequence_step))
            .cloned())
    }

    async fn mark_sent(
        &self,
        send_id: Uuid,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.transition(send_id, SendStatus::Sending, |send| {
            send.status = SendStatus::Sent;
            send.provider_message_id = Some(provider_message_id.to_string());
            send.sent_at = Some(now);
            send.error_message = None;
            send.updated_at = now;
        })
    }

    async fn mark_failed(
        &self,
        send_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.transition(send_id, SendStatus::Sending, |send| {
            send.status = SendStatus::Failed;
            send.error_message = Some(error.to_string());
            send.updated_at = now;
        })
    }

    async fn increment_sent(&self, queue_id: Uuid) -> Result<(), AppError> {
        let mut state = self.lock()?;
        Self::take_failure(&mut state.failing_increments, "counter update")?;
        if let Some(queue) = state.queues.get_mut(&queue_id) {
            queue.emails_sent += 1;
        }
        Ok(())
    }

    async fn increment_failed(&self, queue_id: Uuid) -> Result<(), AppError> {
        let mut state = self.lock()?;
        Self::take_failure(&mut state.failing_increments, "counter update")?;
        if let Some(queue) = state.queues.get_mut(&queue_id) {
            queue.emails_failed += 1;
        }
        Ok(())
    }

    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailSend>, AppError> {
        let mut state = self.lock()?;
        let mut failed = Vec::new();
        for send in state
            .sends
            .iter_mut()
            .filter(|s| s.status == SendStatus::Sending && s.updated_at < claimed_before)
        {
            send.status = SendStatus::Failed;
            send.error_message = Some(error.to_string());
            send.updated_at = now;
            failed.push(send.clone());
        }
        Ok(failed)
    }

    async fn get_send(&self, send_id: Uuid) -> Result<Option<EmailSend>, AppError> {
        Ok(self.lock()?.sends.iter().find(|s| s.id == send_id).cloned())
    }

    async fn list_sends(
        &self,
        queue_id: Uuid,
        status: Option<SendStatus>,
    ) -> Result<Vec<EmailSend>, AppError> {
        let state = self.lock()?;
        let mut sends: Vec<EmailSend> = state
            .sends
            .iter()
            .filter(|s| s.queue_id() == Some(queue_id))
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        sends.sort_by_key(|s| s.created_at);
        Ok(sends)
    }

    async fn requeue_send(&self, send_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.transition(send_id, SendStatus::Failed, |send| {
            send.status = SendStatus::Queued;
            send.error_message = None;
            send.updated_at = now;
        })
    }

    async fn reopen_queue(&self, queue_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state.queues.get_mut(&queue_id) {
            Some(queue) if queue.status == QueueStatus::Completed => {
                queue.status = QueueStatus::Processing;
                queue.completed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
