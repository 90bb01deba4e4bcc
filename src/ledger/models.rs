use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Row, Type};
use std::fmt;
use uuid::Uuid;

use crate::amount::Amount;
use crate::error::AppResult;

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_entry_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Credit,
    Debit,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Credit => f.write_str("credit"),
            EntryType::Debit => f.write_str("debit"),
        }
    }
}

/// Append-only journal entry. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub app_id: String,
    pub user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub entry_type: EntryType,
    pub ref_id: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let amount: BigDecimal = row.try_get("amount")?;

        Ok(LedgerEntry {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            user_id: row.try_get("user_id")?,
            asset: row.try_get("asset")?,
            amount: Amount::from(amount),
            entry_type: row.try_get("entry_type")?,
            ref_id: row.try_get("ref_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A single intended ledger effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub app_id: String,
    pub user_id: String,
    pub asset: String,
    pub amount: Amount,
    pub ref_id: String,
    pub idempotency_key: String,
}

/// Row handed to the store; `LedgerWrite` plus its direction
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub write: LedgerWrite,
    pub entry_type: EntryType,
}

/// Result of an idempotent write. `applied == false` means the key already
/// existed and `entry` is the row written by the earlier call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWriteOutcome {
    pub applied: bool,
    pub entry: LedgerEntry,
}

/// What the store reports for a single insert attempt
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(LedgerEntry),
    DuplicateKey,
}

pub fn settlement_credit_key(tip_intent_id: Uuid) -> String {
    format!("settlement:tip_intent:{}", tip_intent_id)
}

pub fn withdrawal_debit_key(withdrawal_id: Uuid) -> String {
    format!("withdrawal:debit:{}", withdrawal_id)
}
