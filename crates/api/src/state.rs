//! Shared application state for the Axum API server.

use std::sync::Arc;

use cadence_common::config::AppConfig;
use cadence_worker::driver::QueueDriver;
use cadence_worker::store::SendStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<QueueDriver>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(driver: Arc<QueueDriver>, config: AppConfig) -> Self {
        Self { driver, config }
    }

    pub fn store(&self) -> &Arc<dyn SendStore> {
        self.driver.store()
    }
}
