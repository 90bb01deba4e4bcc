use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Row, Type};
use std::fmt;
use uuid::Uuid;

use crate::amount::Amount;
use crate::error::AppResult;

/// Settlement state of the invoice behind a tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "invoice_state", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    Unpaid,
    Settled,
    Failed,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Unpaid => "UNPAID",
            InvoiceState::Settled => "SETTLED",
            InvoiceState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payment intent per invoice
///
/// INVARIANT: `settled_at.is_some()` iff `invoice_state == Settled`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipIntent {
    pub id: Uuid,
    pub app_id: String,
    pub post_id: Option<String>,
    pub from_user_id: String,
    pub to_user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub invoice: String,
    pub invoice_state: InvoiceState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,

    // Reconciliation bookkeeping
    pub settlement_retry_count: i32,
    pub settlement_next_retry_at: Option<DateTime<Utc>>,
    pub settlement_last_error: Option<String>,
    pub settlement_failure_reason: Option<String>,
    pub settlement_last_checked_at: Option<DateTime<Utc>>,
}

impl TipIntent {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let amount: BigDecimal = row.try_get("amount")?;

        Ok(TipIntent {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            post_id: row.try_get("post_id")?,
            from_user_id: row.try_get("from_user_id")?,
            to_user_id: row.try_get("to_user_id")?,
            asset: row.try_get("asset")?,
            amount: Amount::from(amount),
            invoice: row.try_get("invoice")?,
            invoice_state: row.try_get("invoice_state")?,
            created_at: row.try_get("created_at")?,
            settled_at: row.try_get("settled_at")?,
            settlement_retry_count: row.try_get("settlement_retry_count")?,
            settlement_next_retry_at: row.try_get("settlement_next_retry_at")?,
            settlement_last_error: row.try_get("settlement_last_error")?,
            settlement_failure_reason: row.try_get("settlement_failure_reason")?,
            settlement_last_checked_at: row.try_get("settlement_last_checked_at")?,
        })
    }

    /// Retry backoff still running at `now`
    pub fn is_retry_pending(&self, now: DateTime<Utc>) -> bool {
        matches!(self.settlement_next_retry_at, Some(next) if next > now)
    }
}

/// Input of the tip-creation flow
#[derive(Debug, Clone)]
pub struct NewTipIntent {
    pub app_id: String,
    pub post_id: Option<String>,
    pub from_user_id: String,
    pub to_user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub invoice: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for state listings, ordered by `(created_at, id)` ascending
#[derive(Debug, Clone)]
pub struct TipIntentQuery {
    pub state: InvoiceState,
    pub app_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    /// Keyset position; only rows strictly after it are returned
    pub after: Option<(DateTime<Utc>, Uuid)>,
    pub limit: usize,
}

impl TipIntentQuery {
    pub fn new(state: InvoiceState, limit: usize) -> Self {
        Self {
            state,
            app_id: None,
            created_from: None,
            created_to: None,
            after: None,
            limit,
        }
    }

    /// Whether `intent` passes every filter except the keyset position
    pub fn matches(&self, intent: &TipIntent) -> bool {
        intent.invoice_state == self.state
            && self.app_id.as_ref().map_or(true, |app| &intent.app_id == app)
            && self.created_from.map_or(true, |from| intent.created_at >= from)
            && self.created_to.map_or(true, |to| intent.created_at <= to)
    }
}
