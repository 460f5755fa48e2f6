//! Per-send delivery.
//!
//! Sends in a batch go out strictly one after another with a fixed pause in
//! between, to stay under the provider's rate limit. Each send's outcome is
//! recorded on its own row; nothing that happens to one send aborts the
//! rest of the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use cadence_common::types::{EmailSend, SendQueue};
use cadence_mailer::{EmailProvider, OutgoingEmail};

use crate::credits::CreditLedger;
use crate::personalize::render_email;
use crate::settings::WorkerSettings;
use crate::store::SendStore;

/// Credits charged per successfully sent email.
const CREDITS_PER_SEND: u32 = 1;

/// Result of delivering one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: String },
    Failed { error: String },
    /// The send was no longer `queued` when we tried to claim it.
    Skipped,
    /// The claim itself hit a storage error; the send is still `queued`.
    Deferred { error: String },
}

/// Tally of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Sends left `queued` because claiming them failed.
    pub deferred: u32,
}

impl BatchReport {
    /// Sends that were claimed and reached a terminal status.
    pub fn processed(&self) -> u32 {
        self.sent + self.failed
    }

    /// Every attempted send failed (and at least one was attempted).
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.sent == 0
    }

    /// The next batch should wait out the failure backoff.
    pub fn needs_backoff(&self) -> bool {
        self.all_failed() || self.deferred > 0
    }

    fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent { .. } => self.sent += 1,
            SendOutcome::Failed { .. } => self.failed += 1,
            SendOutcome::Skipped => self.skipped += 1,
            SendOutcome::Deferred { .. } => self.deferred += 1,
        }
    }
}

/// Delivers sends and records their outcomes.
pub struct Deliverer {
    store: Arc<dyn SendStore>,
    provider: Arc<dyn EmailProvider>,
    credits: Arc<dyn CreditLedger>,
    settings: Arc<WorkerSettings>,
}

impl Deliverer {
    pub fn new(
        store: Arc<dyn SendStore>,
        provider: Arc<dyn EmailProvider>,
        credits: Arc<dyn CreditLedger>,
        settings: Arc<WorkerSettings>,
    ) -> Self {
        Self {
            store,
            provider,
            credits,
            settings,
        }
    }

    /// Deliver `sends` in order, pausing `send_delay` between them.
    ///
    /// A claim that fails with a storage error stops the batch: the rest stay
    /// `queued` for the next invocation.
    pub async fn deliver_batch(&self, queue: &SendQueue, sends: &[EmailSend]) -> BatchReport {
        let mut report = BatchReport::default();

        for (idx, send) in sends.iter().enumerate() {
            if idx > 0 && !self.settings.send_delay.is_zero() {
                tokio::time::sleep(self.settings.send_delay).await;
            }
            let outcome = self.deliver_one(queue, send).await;
            report.record(&outcome);
            if matches!(outcome, SendOutcome::Deferred { .. }) {
                break;
            }
        }

        report
    }

    /// Claim, render, send and record a single send.
    pub async fn deliver_one(&self, queue: &SendQueue, send: &EmailSend) -> SendOutcome {
        match self.store.claim_send(send.id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(send_id = %send.id, "Send already claimed elsewhere, skipping");
                return SendOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(send_id = %send.id, error = %e, "Failed to claim send");
                return SendOutcome::Deferred {
                    error: e.to_string(),
                };
            }
        }

        match self.attempt(queue, send).await {
            Ok(message_id) => {
                self.record_sent(queue, send, &message_id).await;
                SendOutcome::Sent { message_id }
            }
            Err(error) => {
                self.record_failed(queue, send, &error).await;
                SendOutcome::Failed { error }
            }
        }
    }

    /// Everything between the claim and the provider's answer.
    async fn attempt(&self, queue: &SendQueue, send: &EmailSend) -> Result<String, String> {
        let template = self
            .store
            .load_template(send.campaign_id, send.sequence_step)
            .await
            .map_err(|e| format!("failed to load template: {}", e))?
            .ok_or_else(|| format!("template not found for step {}", send.sequence_step))?;

        let from = queue
            .from_email
            .as_deref()
            .or(self.settings.default_from.as_deref())
            .ok_or_else(|| "no sender address configured".to_string())?;

        let rendered = render_email(send, &template, &self.settings.app_url);
        let email = OutgoingEmail {
            from: from.to_string(),
            to: send.recipient_email.clone(),
            subject: rendered.subject,
            html: rendered.html,
            headers: delivery_headers(&rendered.unsubscribe_url, queue.id, send),
        };

        self.provider.send(&email).await.map_err(|e| e.to_string())
    }

    async fn record_sent(&self, queue: &SendQueue, send: &EmailSend, message_id: &str) {
        match self.store.mark_sent(send.id, message_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                // Already settled elsewhere (reaper); its counters stand.
                tracing::warn!(
                    send_id = %send.id,
                    message_id,
                    "Send no longer in sending state, not recording delivery"
                );
                return;
            }
            Err(e) => {
                tracing::error!(send_id = %send.id, error = %e, "Failed to mark send as sent");
            }
        }

        // The email has left; a billing hiccup must not flip it to failed.
        if let Err(e) = self.credits.deduct(queue.user_id, CREDITS_PER_SEND).await {
            tracing::warn!(
                user_id = %queue.user_id,
                send_id = %send.id,
                error = %e,
                "Failed to deduct credit"
            );
        }

        if let Err(e) = self.store.increment_sent(queue.id).await {
            tracing::error!(queue_id = %queue.id, error = %e, "Failed to increment sent counter");
        }

        tracing::info!(
            queue_id = %queue.id,
            send_id = %send.id,
            message_id,
            "Email sent"
        );
    }

    async fn record_failed(&self, queue: &SendQueue, send: &EmailSend, error: &str) {
        match self.store.mark_failed(send.id, error, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    send_id = %send.id,
                    error,
                    "Send no longer in sending state, not recording failure"
                );
                return;
            }
            Err(e) => {
                tracing::error!(send_id = %send.id, error = %e, "Failed to mark send as failed");
            }
        }

        if let Err(e) = self.store.increment_failed(queue.id).await {
            tracing::error!(queue_id = %queue.id, error = %e, "Failed to increment failed counter");
        }

        tracing::warn!(
            queue_id = %queue.id,
            send_id = %send.id,
            error,
            "Email delivery failed"
        );
    }
}

/// Anti-abuse and correlation headers attached to every email.
pub fn delivery_headers(
    unsubscribe_url: &str,
    queue_id: Uuid,
    send: &EmailSend,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "List-Unsubscribe".to_string(),
            format!("<{}>", unsubscribe_url),
        ),
        (
            "List-Unsubscribe-Post".to_string(),
            "List-Unsubscribe=One-Click".to_string(),
        ),
        ("X-Campaign-Id".to_string(), send.campaign_id.to_string()),
        ("X-Queue-Id".to_string(), queue_id.to_string()),
        ("X-Send-Id".to_string(), send.id.to_string()),
    ])
}
