use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Processing => write!(f, "processing"),
            QueueStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Delivery status of a single send.
///
/// A send moves `Queued → Sending → {Sent | Failed}` once per attempt.
/// Only a manual re-queue moves `Failed` back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl SendStatus {
    /// Whether the worker will never touch this send again on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Failed)
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Queued => write!(f, "queued"),
            SendStatus::Sending => write!(f, "sending"),
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SendStatus::Queued),
            "sending" => Ok(SendStatus::Sending),
            "sent" => Ok(SendStatus::Sent),
            "failed" => Ok(SendStatus::Failed),
            other => Err(format!(
                "Invalid send status '{}'. Valid statuses: queued, sending, sent, failed",
                other
            )),
        }
    }
}

/// A batch-send job grouping many individual sends.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SendQueue {
    pub id: Uuid,
    /// Owner of the queue; billed one credit per sent email.
    pub user_id: Uuid,
    pub campaign_id: Uuid,
    /// Sender override; falls back to the configured default sender.
    pub from_email: Option<String>,
    pub status: QueueStatus,
    pub emails_sent: i64,
    pub emails_failed: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One scheduled delivery of one email to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailSend {
    pub id: Uuid,
    /// Free-form tags. `queue_id` links the send to its parent queue.
    pub metadata: serde_json::Value,
    pub campaign_id: Uuid,
    /// Position of this email in the campaign sequence (1-based).
    pub sequence_step: i32,
    pub recipient_email: String,
    pub recipient_first_name: Option<String>,
    pub recipient_last_name: Option<String>,
    pub subject: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: SendStatus,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailSend {
    /// Parent queue id read from the metadata tag, if present and well-formed.
    pub fn queue_id(&self) -> Option<Uuid> {
        self.metadata
            .get("queue_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Template content for one step of a campaign sequence.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignEmail {
    pub campaign_id: Uuid,
    pub sequence_step: i32,
    pub subject: String,
    pub body_html: String,
}
