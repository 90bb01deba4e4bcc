use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult, TipIntentError};

pub const INVOICE_CONSTRAINT: &str = "tip_intents_invoice_key";

const TIP_INTENT_COLUMNS: &str = r#"
    id, app_id, post_id, from_user_id, to_user_id, asset, amount, invoice,
    invoice_state, created_at, settled_at, settlement_retry_count,
    settlement_next_retry_at, settlement_last_error, settlement_failure_reason,
    settlement_last_checked_at
"#;

/// Persistence seam for tip intents
#[async_trait]
pub trait TipIntentStore: Send + Sync {
    async fn create(&self, new: NewTipIntent) -> AppResult<TipIntent>;

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<TipIntent>>;

    async fn find_by_invoice(&self, invoice: &str) -> AppResult<Vec<TipIntent>>;

    /// Exactly one match or `TipIntentError::NotFound`
    async fn find_by_invoice_or_throw(&self, invoice: &str) -> AppResult<TipIntent> {
        let mut matches = self.find_by_invoice(invoice).await?;
        if matches.len() != 1 {
            return Err(TipIntentError::NotFound {
                invoice: invoice.to_string(),
                matches: matches.len(),
            }
            .into());
        }
        Ok(matches.remove(0))
    }

    /// Idempotent state write.
    ///
    /// - Same state: no-op, stored record returned unchanged.
    /// - SETTLED: `settled_at` is set only if it was unset.
    /// - A SETTLED record never moves to another state; the write is
    ///   ignored and the stored record returned.
    async fn update_invoice_state(
        &self,
        id: Uuid,
        state: InvoiceState,
        now: DateTime<Utc>,
    ) -> AppResult<TipIntent>;

    async fn list_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<Vec<TipIntent>>;

    /// Ignores `after` and `limit`
    async fn count_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<u64>;

    /// Atomically bumps the retry counter and records the error
    async fn increment_settlement_retry(
        &self,
        id: Uuid,
        error: &str,
        checked_at: DateTime<Utc>,
    ) -> AppResult<TipIntent>;

    async fn schedule_settlement_retry(&self, id: Uuid, next_retry_at: DateTime<Utc>)
        -> AppResult<()>;

    async fn record_settlement_failure(
        &self,
        id: Uuid,
        reason: &str,
        error: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn mark_settlement_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> AppResult<()>;
}

/// Postgres-backed tip intent repository
pub struct PgTipIntentRepository {
    pub pool: PgPool,
}

impl PgTipIntentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn require(&self, id: Uuid) -> AppResult<TipIntent> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| TipIntentError::NotFoundById(id).into())
    }

    fn ensure_found(id: Uuid, result: sqlx::postgres::PgQueryResult) -> AppResult<()> {
        if result.rows_affected() == 0 {
            return Err(TipIntentError::NotFoundById(id).into());
        }
        Ok(())
    }
}

#[async_trait]
impl TipIntentStore for PgTipIntentRepository {
    async fn create(&self, new: NewTipIntent) -> AppResult<TipIntent> {
        new.amount.assert_positive()?;

        let sql = format!(
            r#"
            INSERT INTO tip_intents (
                id, app_id, post_id, from_user_id, to_user_id, asset, amount, invoice,
                invoice_state, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            TIP_INTENT_COLUMNS
        );

        let result = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.app_id)
            .bind(&new.post_id)
            .bind(&new.from_user_id)
            .bind(&new.to_user_id)
            .bind(&new.asset)
            .bind(BigDecimal::from(new.amount.clone()))
            .bind(&new.invoice)
            .bind(InvoiceState::Unpaid)
            .bind(new.created_at)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => TipIntent::from_row(&row),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && db.constraint() == Some(INVOICE_CONSTRAINT) =>
            {
                Err(TipIntentError::DuplicateInvoice(new.invoice).into())
            }
            Err(error) => Err(AppError::Database(error)),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<TipIntent>> {
        let sql = format!("SELECT {} FROM tip_intents WHERE id = $1", TIP_INTENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(TipIntent::from_row).transpose()
    }

    async fn find_by_invoice(&self, invoice: &str) -> AppResult<Vec<TipIntent>> {
        // LIMIT 2 is enough to tell "one" from "more than one"
        let sql = format!(
            "SELECT {} FROM tip_intents WHERE invoice = $1 LIMIT 2",
            TIP_INTENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(invoice)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TipIntent::from_row).collect()
    }

    async fn update_invoice_state(
        &self,
        id: Uuid,
        state: InvoiceState,
        now: DateTime<Utc>,
    ) -> AppResult<TipIntent> {
        let settled_at = (state == InvoiceState::Settled).then_some(now);

        let sql = format!(
            r#"
            UPDATE tip_intents
            SET invoice_state = $2,
                settled_at = COALESCE(settled_at, $3)
            WHERE id = $1
              AND invoice_state <> $2
              AND invoice_state <> $4
            RETURNING {}
            "#,
            TIP_INTENT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(state)
            .bind(settled_at)
            .bind(InvoiceState::Settled)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => TipIntent::from_row(&row),
            None => {
                let existing = self.require(id).await?;
                if existing.invoice_state != state {
                    warn!(
                        tip_intent_id = %id,
                        current = %existing.invoice_state,
                        requested = %state,
                        "Ignoring state write against a settled tip intent"
                    );
                }
                Ok(existing)
            }
        }
    }

    async fn list_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<Vec<TipIntent>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tip_intents
            WHERE invoice_state = $1
              AND ($2::text IS NULL OR app_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
              AND ($5::timestamptz IS NULL OR (created_at, id) > ($5, $6))
            ORDER BY created_at ASC, id ASC
            LIMIT $7
            "#,
            TIP_INTENT_COLUMNS
        );

        let (after_created_at, after_id) = match query.after {
            Some((created_at, id)) => (Some(created_at), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query(&sql)
            .bind(query.state)
            .bind(&query.app_id)
            .bind(query.created_from)
            .bind(query.created_to)
            .bind(after_created_at)
            .bind(after_id)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TipIntent::from_row).collect()
    }

    async fn count_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tip_intents
            WHERE invoice_state = $1
              AND ($2::text IS NULL OR app_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            "#,
        )
        .bind(query.state)
        .bind(&query.app_id)
        .bind(query.created_from)
        .bind(query.created_to)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn increment_settlement_retry(
        &self,
        id: Uuid,
        error: &str,
        checked_at: DateTime<Utc>,
    ) -> AppResult<TipIntent> {
        let sql = format!(
            r#"
            UPDATE tip_intents
            SET settlement_retry_count = settlement_retry_count + 1,
                settlement_last_error = $2,
                settlement_last_checked_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            TIP_INTENT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(error)
            .bind(checked_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TipIntentError::NotFoundById(id))?;

        TipIntent::from_row(&row)
    }

    async fn schedule_settlement_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE tip_intents SET settlement_next_retry_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(id, result)
    }

    async fn record_settlement_failure(
        &self,
        id: Uuid,
        reason: &str,
        error: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tip_intents
            SET settlement_failure_reason = $2,
                settlement_last_error = COALESCE($3, settlement_last_error),
                settlement_next_retry_at = NULL,
                settlement_last_checked_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(error)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(id, result)
    }

    async fn mark_settlement_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE tip_intents SET settlement_last_checked_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(checked_at)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(id, result)
    }
}
