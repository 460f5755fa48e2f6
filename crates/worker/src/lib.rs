//! Batched email send worker.
//!
//! An invocation drains one bounded batch of due sends for a queue
//! ([`driver::QueueDriver`]), delivers them one by one
//! ([`delivery::Deliverer`]), and schedules a continuation on the
//! [`continuation::ContinuationQueue`] while due work remains.

pub mod continuation;
pub mod credits;
pub mod delivery;
pub mod driver;
pub mod memory;
pub mod personalize;
pub mod reaper;
pub mod settings;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
