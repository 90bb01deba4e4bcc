use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::repository::WithdrawalStore;
use crate::error::{AppResult, WithdrawalError};

/// In-memory withdrawal store. Guards are checked under the write lock,
/// which gives the same compare-and-set behaviour as the SQL `WHERE state`.
#[derive(Clone, Default)]
pub struct InMemoryWithdrawalStore {
    withdrawals: Arc<RwLock<HashMap<Uuid, Withdrawal>>>,
}

impl InMemoryWithdrawalStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        expected: &[WithdrawalState],
        apply: F,
    ) -> AppResult<Withdrawal>
    where
        F: FnOnce(&mut Withdrawal) + Send,
    {
        let mut withdrawals = self.withdrawals.write().await;
        let withdrawal = withdrawals
            .get_mut(&id)
            .ok_or(WithdrawalError::NotFound(id))?;

        if !expected.contains(&withdrawal.state) {
            return Err(WithdrawalError::TransitionConflict {
                id,
                expected: expected.to_vec(),
                actual: withdrawal.state,
            }
            .into());
        }

        apply(withdrawal);
        Ok(withdrawal.clone())
    }
}

#[async_trait]
impl WithdrawalStore for InMemoryWithdrawalStore {
    async fn create(&self, new: NewWithdrawal, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        new.amount.assert_positive()?;

        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            app_id: new.app_id,
            user_id: new.user_id,
            asset: new.asset,
            amount: new.amount,
            to_address: new.to_address,
            state: WithdrawalState::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tx_hash: None,
            debited_at: None,
        };

        self.withdrawals
            .write()
            .await
            .insert(withdrawal.id, withdrawal.clone());
        Ok(withdrawal)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Withdrawal>> {
        Ok(self.withdrawals.read().await.get(&id).cloned())
    }

    async fn list_ready_for_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<Withdrawal>> {
        let withdrawals = self.withdrawals.read().await;
        let mut ready: Vec<Withdrawal> = withdrawals
            .values()
            .filter(|w| w.is_ready(now))
            .cloned()
            .collect();

        ready.sort_by_key(|w| (w.created_at, w.id));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn mark_processing(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        self.transition(id, &CLAIMABLE_STATES, move |w| {
            w.state = WithdrawalState::Processing;
            w.updated_at = now;
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let tx_hash = tx_hash.to_string();
        self.transition(id, &[WithdrawalState::Processing], move |w| {
            w.state = WithdrawalState::Completed;
            w.tx_hash = Some(tx_hash);
            w.completed_at = Some(now);
            w.updated_at = now;
            w.next_retry_at = None;
            w.last_error = None;
        })
        .await
    }

    async fn mark_retry_pending(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let error = error.to_string();
        self.transition(id, &[WithdrawalState::Processing], move |w| {
            w.state = WithdrawalState::RetryPending;
            w.retry_count += 1;
            w.last_error = Some(error);
            w.next_retry_at = Some(next_retry_at);
            w.updated_at = now;
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        increment_retry: bool,
        now: DateTime<Utc>,
    ) -> AppResult<Withdrawal> {
        let error = error.to_string();
        self.transition(id, &[WithdrawalState::Processing], move |w| {
            w.state = WithdrawalState::Failed;
            if increment_retry {
                w.retry_count += 1;
            }
            w.last_error = Some(error);
            w.next_retry_at = None;
            w.updated_at = now;
        })
        .await
    }

    async fn list_awaiting_debit(&self, limit: usize) -> AppResult<Vec<Withdrawal>> {
        let withdrawals = self.withdrawals.read().await;
        let mut awaiting: Vec<Withdrawal> = withdrawals
            .values()
            .filter(|w| w.awaits_debit())
            .cloned()
            .collect();

        awaiting.sort_by_key(|w| (w.completed_at, w.id));
        awaiting.truncate(limit);
        Ok(awaiting)
    }

    async fn mark_debited(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Withdrawal> {
        self.transition(id, &[WithdrawalState::Completed], move |w| {
            w.debited_at.get_or_insert(now);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::error::AppError;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn new_withdrawal() -> NewWithdrawal {
        NewWithdrawal {
            app_id: "app".into(),
            user_id: "bob".into(),
            asset: "USDI".into(),
            amount: Amount::parse("4").unwrap(),
            to_address: "addr-bob".into(),
        }
    }

    #[tokio::test]
    async fn test_mark_completed_on_pending_conflicts() {
        let store = InMemoryWithdrawalStore::new();
        let created = store.create(new_withdrawal(), at(0)).await.unwrap();

        let err = store.mark_completed(created.id, "0xabc", at(1)).await.unwrap_err();
        match err {
            AppError::Withdrawal(WithdrawalError::TransitionConflict { actual, .. }) => {
                assert_eq!(actual, WithdrawalState::Pending)
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let unchanged = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(unchanged, created);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let store = InMemoryWithdrawalStore::new();
        let mut zero = new_withdrawal();
        zero.amount = Amount::parse("0").unwrap();

        let err = store.create(zero, at(0)).await.unwrap_err();
        assert!(matches!(err, AppError::Amount(_)));
        assert!(store.list_ready_for_processing(at(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_withdrawal_is_not_found() {
        let store = InMemoryWithdrawalStore::new();
        let err = store.mark_processing(Uuid::new_v4(), at(0)).await.unwrap_err();
        assert!(matches!(err, AppError::Withdrawal(WithdrawalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_happy_path_clears_bookkeeping() {
        let store = InMemoryWithdrawalStore::new();
        let created = store.create(new_withdrawal(), at(0)).await.unwrap();

        store.mark_processing(created.id, at(1)).await.unwrap();
        store
            .mark_retry_pending(created.id, "timeout", at(5), at(1))
            .await
            .unwrap();
        store.mark_processing(created.id, at(6)).await.unwrap();
        let done = store.mark_completed(created.id, "0xabc", at(7)).await.unwrap();

        assert_eq!(done.state, WithdrawalState::Completed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(done.completed_at, Some(at(7)));
        assert_eq!(done.last_error, None);
        assert_eq!(done.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_terminal_states_reject_claims() {
        let store = InMemoryWithdrawalStore::new();
        let created = store.create(new_withdrawal(), at(0)).await.unwrap();
        store.mark_processing(created.id, at(1)).await.unwrap();
        store.mark_failed(created.id, "rejected", false, at(2)).await.unwrap();

        assert!(store.mark_processing(created.id, at(3)).await.is_err());
        let failed = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(failed.state, WithdrawalState::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_ready_list_respects_next_retry_at() {
        let store = InMemoryWithdrawalStore::new();
        let waiting = store.create(new_withdrawal(), at(0)).await.unwrap();
        let fresh = store.create(new_withdrawal(), at(1)).await.unwrap();

        store.mark_processing(waiting.id, at(2)).await.unwrap();
        store
            .mark_retry_pending(waiting.id, "busy", at(10), at(2))
            .await
            .unwrap();

        let early = store.list_ready_for_processing(at(5), 10).await.unwrap();
        assert_eq!(early.iter().map(|w| w.id).collect::<Vec<_>>(), vec![fresh.id]);

        let later = store
            .list_ready_for_processing(at(10) + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(
            later.iter().map(|w| w.id).collect::<Vec<_>>(),
            vec![waiting.id, fresh.id]
        );
    }

    #[tokio::test]
    async fn test_debit_bookkeeping_only_on_completed() {
        let store = InMemoryWithdrawalStore::new();
        let done = store.create(new_withdrawal(), at(0)).await.unwrap();
        let open = store.create(new_withdrawal(), at(1)).await.unwrap();

        store.mark_processing(done.id, at(2)).await.unwrap();
        store.mark_completed(done.id, "0xabc", at(3)).await.unwrap();

        let awaiting = store.list_awaiting_debit(10).await.unwrap();
        assert_eq!(awaiting.iter().map(|w| w.id).collect::<Vec<_>>(), vec![done.id]);

        let err = store.mark_debited(open.id, at(4)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Withdrawal(WithdrawalError::TransitionConflict { .. })
        ));

        let debited = store.mark_debited(done.id, at(4)).await.unwrap();
        assert_eq!(debited.debited_at, Some(at(4)));
        let again = store.mark_debited(done.id, at(9)).await.unwrap();
        assert_eq!(again.debited_at, Some(at(4)));
        assert!(store.list_awaiting_debit(10).await.unwrap().is_empty());
    }
}
