//! Outbound email delivery.
//!
//! The worker talks to the transactional email API only through
//! [`EmailProvider`], so batches can be exercised against scripted providers
//! in tests and against [`ResendClient`] in production.

pub mod email;
pub mod resend;

pub use email::{DeliveryError, EmailProvider, OutgoingEmail};
pub use resend::ResendClient;
