use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// A fully rendered email ready to hand to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    /// Extra headers (list-unsubscribe, correlation ids). Ordered so the
    /// serialized request is stable.
    pub headers: BTreeMap<String, String>,
}

/// Why a single delivery did not go through.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rejected email ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Provider response did not include a message id")]
    MissingMessageId,
}

/// Transactional email API.
///
/// Returns the provider's message id on success.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, DeliveryError>;
}
