//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use uuid::Uuid;

use cadence_common::error::AppError;
use cadence_common::types::{CampaignEmail, EmailSend, QueueStatus, SendQueue, SendStatus};
use cadence_mailer::{DeliveryError, EmailProvider, OutgoingEmail};

use crate::continuation::InMemoryContinuationQueue;
use crate::credits::{CreditLedger, InMemoryCreditLedger};
use crate::delivery::Deliverer;
use crate::driver::QueueDriver;
use crate::memory::InMemorySendStore;
use crate::settings::WorkerSettings;

pub const STARTING_CREDITS: i64 = 100;

pub fn test_settings(batch_size: u32) -> WorkerSettings {
    WorkerSettings {
        batch_size,
        send_delay: Duration::ZERO,
        max_chain_length: 1000,
        failure_backoff: Duration::from_secs(30),
        default_from: None,
        app_url: Url::parse("https://app.example.com").unwrap(),
        continuation_poll_interval: Duration::from_millis(10),
        stale_claim_timeout: Duration::from_secs(600),
    }
}

pub fn make_queue() -> SendQueue {
    SendQueue {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        campaign_id: Uuid::new_v4(),
        from_email: Some("Team <team@example.com>".to_string()),
        status: QueueStatus::Pending,
        emails_sent: 0,
        emails_failed: 0,
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
    }
}

/// A queued send due an hour ago. `index` orders `created_at`.
pub fn make_send(queue_id: Uuid, index: usize) -> EmailSend {
    let base = Utc::now() - chrono::Duration::hours(1);
    EmailSend {
        id: Uuid::new_v4(),
        metadata: serde_json::json!({ "queue_id": queue_id.to_string() }),
        campaign_id: Uuid::new_v4(),
        sequence_step: 1,
        recipient_email: format!("recipient{}@example.com", index),
        recipient_first_name: Some("Ada".to_string()),
        recipient_last_name: Some("Lovelace".to_string()),
        subject: "Quick question, {{first_name}}".to_string(),
        scheduled_at: base,
        status: SendStatus::Queued,
        provider_message_id: None,
        error_message: None,
        sent_at: None,
        created_at: base + chrono::Duration::seconds(index as i64),
        updated_at: base,
    }
}

pub fn make_template(campaign_id: Uuid, sequence_step: i32) -> CampaignEmail {
    CampaignEmail {
        campaign_id,
        sequence_step,
        subject: "Quick question, {{first_name}}".to_string(),
        body_html: format!(
            "<p>Hello {{{{first_name}}}},</p><p>Step {} of our sequence.</p>",
            sequence_step
        ),
    }
}

/// Provider that records every call and fails for chosen recipients.
#[derive(Default)]
pub struct ScriptedProvider {
    failing: HashSet<String>,
    calls: Mutex<Vec<OutgoingEmail>>,
}

impl ScriptedProvider {
    pub fn working() -> Self {
        Self::default()
    }

    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            failing: recipients.iter().map(|r| r.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<OutgoingEmail> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailProvider for ScriptedProvider {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, DeliveryError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(email.clone());
        if self.failing.contains(&email.to) {
            return Err(DeliveryError::Rejected {
                status: 500,
                body: "internal server error".to_string(),
            });
        }
        Ok(format!("msg-{}", calls.len()))
    }
}

/// Ledger whose every deduction errors.
pub struct FailingCreditLedger;

#[async_trait]
impl CreditLedger for FailingCreditLedger {
    async fn deduct(&self, user_id: Uuid, _amount: u32) -> Result<(), AppError> {
        Err(AppError::Internal(format!("ledger unavailable for {}", user_id)))
    }
}

/// One queue wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<InMemorySendStore>,
    pub provider: Arc<ScriptedProvider>,
    pub credits: Arc<InMemoryCreditLedger>,
    pub continuations: Arc<InMemoryContinuationQueue>,
    pub settings: Arc<WorkerSettings>,
    pub driver: Arc<QueueDriver>,
    pub queue: SendQueue,
    next_index: AtomicUsize,
}

impl Harness {
    pub fn new(provider: ScriptedProvider) -> Self {
        Self::with_batch_size(provider, 10)
    }

    pub fn with_batch_size(provider: ScriptedProvider, batch_size: u32) -> Self {
        let store = Arc::new(InMemorySendStore::new());
        let provider = Arc::new(provider);
        let credits = Arc::new(InMemoryCreditLedger::new());
        let continuations = Arc::new(InMemoryContinuationQueue::new());
        let settings = test_settings(batch_size);

        let queue = make_queue();
        store.insert_queue(queue.clone()).unwrap();
        store
            .insert_template(make_template(queue.campaign_id, 1))
            .unwrap();
        credits.set_balance(queue.user_id, STARTING_CREDITS);

        let driver = Arc::new(QueueDriver::new(
            store.clone(),
            provider.clone(),
            credits.clone(),
            continuations.clone(),
            settings.clone(),
        ));

        Self {
            store,
            provider,
            credits,
            continuations,
            settings: Arc::new(settings),
            driver,
            queue,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn deliverer(&self) -> Deliverer {
        Deliverer::new(
            self.store.clone(),
            self.provider.clone(),
            self.credits.clone(),
            self.settings.clone(),
        )
    }

    /// Insert `count` sends due now, in creation order.
    pub fn add_due_sends(&self, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|_| self.insert(chrono::Duration::zero()))
            .collect()
    }

    /// Insert one send scheduled `offset` from now.
    pub fn add_send_in(&self, offset: chrono::Duration) -> Uuid {
        self.insert(offset)
    }

    pub fn queue_snapshot(&self) -> SendQueue {
        self.store.queue(self.queue.id).unwrap()
    }

    fn insert(&self, offset: chrono::Duration) -> Uuid {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut send = make_send(self.queue.id, index);
        send.campaign_id = self.queue.campaign_id;
        if offset > chrono::Duration::zero() {
            send.scheduled_at = Utc::now() + offset;
        }
        let id = send.id;
        self.store.insert_send(send).unwrap();
        id
    }
}
