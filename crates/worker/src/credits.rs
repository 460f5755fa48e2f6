//! Billing credits: one credit per successfully sent email.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use cadence_common::error::AppError;

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct `amount` credits from `user_id`.
    async fn deduct(&self, user_id: Uuid, amount: u32) -> Result<(), AppError>;
}

/// Calls the `decrement_credits` SQL function, which floors the balance at zero.
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn deduct(&self, user_id: Uuid, amount: u32) -> Result<(), AppError> {
        let amount = i32::try_from(amount)
            .map_err(|_| AppError::Validation(format!("Credit amount {} too large", amount)))?;

        let remaining: Option<i64> = sqlx::query_scalar("SELECT decrement_credits($1, $2)")
            .bind(user_id)
            .bind(amount)
            .fetch_one(&self.pool)
            .await?;

        match remaining {
            Some(balance) => {
                tracing::debug!(user_id = %user_id, amount, balance, "Credits deducted");
                if balance == 0 {
                    tracing::warn!(user_id = %user_id, "User is out of credits");
                }
                Ok(())
            }
            None => Err(AppError::NotFound(format!("User {} not found", user_id))),
        }
    }
}

/// Records balances in memory. Unknown users start at zero.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<Uuid, i64>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: Uuid, credits: i64) {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(user_id, credits);
        }
    }

    pub fn balance(&self, user_id: Uuid) -> i64 {
        self.balances
            .lock()
            .ok()
            .and_then(|b| b.get(&user_id).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn deduct(&self, user_id: Uuid, amount: u32) -> Result<(), AppError> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| AppError::Internal("credit ledger lock poisoned".to_string()))?;
        let balance = balances.entry(user_id).or_insert(0);
        *balance = (*balance - i64::from(amount)).max(0);
        Ok(())
    }
}
