use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Row, Type};
use std::fmt;
use uuid::Uuid;

use crate::amount::Amount;
use crate::error::AppResult;

/// Withdrawal state machine
///
/// Valid transitions:
/// - Pending, RetryPending → Processing
/// - Processing → Completed, RetryPending, Failed
/// - Terminal states (Completed, Failed) → NO TRANSITIONS ALLOWED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "withdrawal_state", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalState {
    Pending,
    Processing,
    RetryPending,
    Completed,
    Failed,
}

impl WithdrawalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalState::Pending => "PENDING",
            WithdrawalState::Processing => "PROCESSING",
            WithdrawalState::RetryPending => "RETRY_PENDING",
            WithdrawalState::Completed => "COMPLETED",
            WithdrawalState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalState::Completed | WithdrawalState::Failed)
    }
}

impl fmt::Display for WithdrawalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States a worker may pick a withdrawal up from
pub const CLAIMABLE_STATES: [WithdrawalState; 2] =
    [WithdrawalState::Pending, WithdrawalState::RetryPending];

/// Outbound withdrawal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub app_id: String,
    pub user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub to_address: String,
    pub state: WithdrawalState,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Only set on COMPLETED
    pub tx_hash: Option<String>,
    /// Set once the ledger debit for a COMPLETED withdrawal is recorded
    pub debited_at: Option<DateTime<Utc>>,
}

impl Withdrawal {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let amount: BigDecimal = row.try_get("amount")?;

        Ok(Withdrawal {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            user_id: row.try_get("user_id")?,
            asset: row.try_get("asset")?,
            amount: Amount::from(amount),
            to_address: row.try_get("to_address")?,
            state: row.try_get("state")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            tx_hash: row.try_get("tx_hash")?,
            debited_at: row.try_get("debited_at")?,
        })
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            WithdrawalState::Pending => true,
            WithdrawalState::RetryPending => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// COMPLETED on the network but not yet reflected in the ledger
    pub fn awaits_debit(&self) -> bool {
        self.state == WithdrawalState::Completed && self.debited_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub app_id: String,
    pub user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub to_address: String,
}
