use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult, WithdrawalError};

const WITHDRAWAL_COLUMNS: &str = r#"
    id, app_id, user_id, asset, amount, to_address, state, retry_count,
    next_retry_at, last_error, created_at, updated_at, completed_at, tx_hash,
    debited_at
"#;

/// Persistence seam for withdrawals. Every transition is a conditional
/// update on the current state; a mismatch is reported, never overwritten.
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    async fn create(&self, new: NewWithdrawal, now: DateTime<Utc>) -> AppResult<Withdrawal>;

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Withdrawal>>;

    /// PENDING, or RETRY_PENDING whose `next_retry_at <= now`, oldest first
    async fn list_ready_for_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<Withdrawal>>;

    /// PENDING | RETRY_PENDING → PROCESSING
    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal>;

    /// PROCESSING → COMPLETED, clears retry bookkeeping
    async fn mark_completed(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal>;

    /// PROCESSING → RETRY_PENDING, `retry_count + 1` in the same write
    async fn mark_retry_pending(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal>;

    /// PROCESSING → FAILED
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        increment_retry: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal>;

    /// COMPLETED withdrawals whose ledger debit is not recorded yet, oldest first
    async fn list_awaiting_debit(&self, limit: usize) -> AppResult<Vec<Withdrawal>>;

    /// Records the ledger debit on a COMPLETED withdrawal. Keeps the first
    /// `debited_at` when called again.
    async fn mark_debited(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal>;
}

/// Turns the re-read after an empty conditional update into the right
/// error. A failed re-read is returned as is.
fn missed_update_error(
    id: Uuid,
    expected: &[WithdrawalState],
    reread: AppResult<Option<Withdrawal>>,
) -> AppError {
    match reread {
        Ok(Some(current)) => WithdrawalError::TransitionConflict {
            id,
            expected: expected.to_vec(),
            actual: current.state,
        }
        .into(),
        Ok(None) => WithdrawalError::NotFound(id).into(),
        Err(e) => e,
    }
}

/// Postgres-backed withdrawal repository
pub struct PgWithdrawalRepository {
    pub pool: PgPool,
}

impl PgWithdrawalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conflict_or_missing(&self, id: Uuid, expected: &[WithdrawalState]) -> AppError {
        missed_update_error(id, expected, self.find_by_id(id).await)
    }

    async fn guarded_update(
        &self,
        id: Uuid,
        expected: &[WithdrawalState],
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> AppResult<Withdrawal> {
        match query.fetch_optional(&self.pool).await? {
            Some(row) => Withdrawal::from_row(&row),
            None => Err(self.conflict_or_missing(id, expected).await),
        }
    }
}

#[async_trait]
impl WithdrawalStore for PgWithdrawalRepository {
    async fn create(&self, new: NewWithdrawal, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        new.amount.assert_positive()?;

        let sql = format!(
            r#"
            INSERT INTO withdrawals (
                id, app_id, user_id, asset, amount, to_address, state, retry_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.app_id)
            .bind(&new.user_id)
            .bind(&new.asset)
            .bind(BigDecimal::from(new.amount.clone()))
            .bind(&new.to_address)
            .bind(WithdrawalState::Pending)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        Withdrawal::from_row(&row)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Withdrawal>> {
        let sql = format!("SELECT {} FROM withdrawals WHERE id = $1", WITHDRAWAL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Withdrawal::from_row).transpose()
    }

    async fn list_ready_for_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<Withdrawal>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM withdrawals
            WHERE state = $1
               OR (state = $2 AND (next_retry_at IS NULL OR next_retry_at <= $3))
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
            WITHDRAWAL_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(WithdrawalState::Pending)
            .bind(WithdrawalState::RetryPending)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Withdrawal::from_row).collect()
    }

    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        let sql = format!(
            r#"
            UPDATE withdrawals
            SET state = $2, updated_at = $3
            WHERE id = $1 AND state IN ($4, $5)
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let query = sqlx::query(&sql)
            .bind(id)
            .bind(WithdrawalState::Processing)
            .bind(now)
            .bind(CLAIMABLE_STATES[0])
            .bind(CLAIMABLE_STATES[1]);

        self.guarded_update(id, &CLAIMABLE_STATES, query).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let sql = format!(
            r#"
            UPDATE withdrawals
            SET state = $2, tx_hash = $3, completed_at = $4, updated_at = $4,
                next_retry_at = NULL, last_error = NULL
            WHERE id = $1 AND state = $5
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let query = sqlx::query(&sql)
            .bind(id)
            .bind(WithdrawalState::Completed)
            .bind(tx_hash)
            .bind(now)
            .bind(WithdrawalState::Processing);

        self.guarded_update(id, &[WithdrawalState::Processing], query).await
    }

    async fn mark_retry_pending(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let sql = format!(
            r#"
            UPDATE withdrawals
            SET state = $2, retry_count = retry_count + 1, last_error = $3,
                next_retry_at = $4, updated_at = $5
            WHERE id = $1 AND state = $6
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let query = sqlx::query(&sql)
            .bind(id)
            .bind(WithdrawalState::RetryPending)
            .bind(error)
            .bind(next_retry_at)
            .bind(now)
            .bind(WithdrawalState::Processing);

        self.guarded_update(id, &[WithdrawalState::Processing], query).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        increment_retry: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let sql = format!(
            r#"
            UPDATE withdrawals
            SET state = $2,
                retry_count = retry_count + CASE WHEN $3 THEN 1 ELSE 0 END,
                last_error = $4, next_retry_at = NULL, updated_at = $5
            WHERE id = $1 AND state = $6
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let query = sqlx::query(&sql)
            .bind(id)
            .bind(WithdrawalState::Failed)
            .bind(increment_retry)
            .bind(error)
            .bind(now)
            .bind(WithdrawalState::Processing);

        self.guarded_update(id, &[WithdrawalState::Processing], query).await
    }

    async fn list_awaiting_debit(&self, limit: usize) -> AppResult<Vec<Withdrawal>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM withdrawals
            WHERE state = $1 AND debited_at IS NULL
            ORDER BY completed_at ASC, id ASC
            LIMIT $2
            "#,
            WITHDRAWAL_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(WithdrawalState::Completed)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Withdrawal::from_row).collect()
    }

    async fn mark_debited(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        let sql = format!(
            r#"
            UPDATE withdrawals
            SET debited_at = COALESCE(debited_at, $2)
            WHERE id = $1 AND state = $3
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );

        let query = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .bind(WithdrawalState::Completed);

        self.guarded_update(id, &[WithdrawalState::Completed], query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn withdrawal(id: Uuid, state: WithdrawalState) -> Withdrawal {
        let now = Utc::now();
        Withdrawal {
            id,
            app_id: "app".into(),
            user_id: "bob".into(),
            asset: "USDI".into(),
            amount: Amount::parse("1").unwrap(),
            to_address: "addr".into(),
            state,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tx_hash: None,
            debited_at: None,
        }
    }

    #[test]
    fn test_missed_update_maps_reread() {
        let id = Uuid::new_v4();
        let expected = [WithdrawalState::Pending];

        let conflict = missed_update_error(
            id,
            &expected,
            Ok(Some(withdrawal(id, WithdrawalState::Completed))),
        );
        assert!(matches!(
            conflict,
            AppError::Withdrawal(WithdrawalError::TransitionConflict {
                actual: WithdrawalState::Completed,
                ..
            })
        ));

        let missing = missed_update_error(id, &expected, Ok(None));
        assert!(matches!(
            missing,
            AppError::Withdrawal(WithdrawalError::NotFound(found)) if found == id
        ));

        let failed = missed_update_error(
            id,
            &expected,
            Err(AppError::Internal("connection reset".into())),
        );
        assert!(matches!(failed, AppError::Internal(ref msg) if msg == "connection reset"));
    }
}
