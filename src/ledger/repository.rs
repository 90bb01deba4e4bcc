use async_trait::async_trait;
use sqlx::types::BigDecimal;
use sqlx::PgPool;
use tracing::debug;

use super::models::*;
use crate::error::{AppError, AppResult};

/// Constraint backing the one-entry-per-key invariant
pub const IDEMPOTENCY_CONSTRAINT: &str = "ledger_entries_idempotency_key_key";

/// Persistence seam for the ledger journal
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert one entry. A unique conflict on the idempotency key is
    /// reported as `DuplicateKey`; every other failure is an error.
    async fn insert_entry(&self, entry: NewLedgerEntry) -> AppResult<InsertOutcome>;

    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntry>>;

    async fn list_entries_for_account(
        &self,
        app_id: &str,
        user_id: &str,
        asset: &str,
    ) -> AppResult<Vec<LedgerEntry>>;
}

/// Postgres-backed ledger journal
pub struct PgLedgerRepository {
    pub pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_idempotency_conflict(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() && db.constraint() == Some(IDEMPOTENCY_CONSTRAINT)
        }
        _ => false,
    }
}

#[async_trait]
impl LedgerStore for PgLedgerRepository {
    async fn insert_entry(&self, entry: NewLedgerEntry) -> AppResult<InsertOutcome> {
        let NewLedgerEntry { write, entry_type } = entry;

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, app_id, user_id, asset, amount, entry_type, ref_id, idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, app_id, user_id, asset, amount, entry_type, ref_id,
                      idempotency_key, created_at
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(&write.app_id)
        .bind(&write.user_id)
        .bind(&write.asset)
        .bind(BigDecimal::from(write.amount.clone()))
        .bind(entry_type)
        .bind(&write.ref_id)
        .bind(&write.idempotency_key)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Inserted(LedgerEntry::from_row(&row)?)),
            Err(error) if is_idempotency_conflict(&error) => {
                debug!(key = %write.idempotency_key, "Ledger insert hit existing idempotency key");
                Ok(InsertOutcome::DuplicateKey)
            }
            Err(error) => Err(AppError::Database(error)),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, app_id, user_id, asset, amount, entry_type, ref_id,
                   idempotency_key, created_at
            FROM ledger_entries
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(LedgerEntry::from_row).transpose()
    }

    async fn list_entries_for_account(
        &self,
        app_id: &str,
        user_id: &str,
        asset: &str,
    ) -> AppResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, app_id, user_id, asset, amount, entry_type, ref_id,
                   idempotency_key, created_at
            FROM ledger_entries
            WHERE app_id = $1 AND user_id = $2 AND asset = $3
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .bind(asset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(LedgerEntry::from_row).collect()
    }
}
