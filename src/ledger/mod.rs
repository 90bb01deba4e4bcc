//! Double-entry ledger with idempotent writes.
//!
//! Writes never take a lock. A write first tries to insert; if another
//! writer already holds the idempotency key, the existing row is read back
//! and returned with `applied = false`.

pub mod memory;
pub mod models;
pub mod repository;

use std::sync::Arc;
use tracing::{debug, info};

use crate::amount::Amount;
use crate::error::{AppError, AppResult};
use models::*;
use repository::LedgerStore;

/// Ledger service - the only writer of ledger entries
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn credit_once(&self, write: LedgerWrite) -> AppResult<LedgerWriteOutcome> {
        self.write_once(write, EntryType::Credit).await
    }

    pub async fn debit_once(&self, write: LedgerWrite) -> AppResult<LedgerWriteOutcome> {
        self.write_once(write, EntryType::Debit).await
    }

    /// Σcredits − Σdebits for one account, exact.
    pub async fn get_balance(&self, app_id: &str, user_id: &str, asset: &str) -> AppResult<Amount> {
        let entries = self
            .store
            .list_entries_for_account(app_id, user_id, asset)
            .await?;

        Ok(entries.iter().fold(Amount::zero(), |balance, entry| match entry.entry_type {
            EntryType::Credit => &balance + &entry.amount,
            EntryType::Debit => &balance - &entry.amount,
        }))
    }

    async fn write_once(
        &self,
        write: LedgerWrite,
        entry_type: EntryType,
    ) -> AppResult<LedgerWriteOutcome> {
        write.amount.assert_positive()?;
        let key = write.idempotency_key.clone();

        match self.store.insert_entry(NewLedgerEntry { write, entry_type }).await? {
            InsertOutcome::Inserted(entry) => {
                info!(
                    key = %entry.idempotency_key,
                    entry_type = %entry.entry_type,
                    user_id = %entry.user_id,
                    asset = %entry.asset,
                    amount = %entry.amount,
                    "Ledger entry applied"
                );
                Ok(LedgerWriteOutcome { applied: true, entry })
            }
            InsertOutcome::DuplicateKey => {
                let entry = self
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!(
                            "idempotency key {} conflicted but no entry was found",
                            key
                        ))
                    })?;
                debug!(key = %key, "Ledger write replayed, existing entry returned");
                Ok(LedgerWriteOutcome { applied: false, entry })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryLedgerStore;
    use super::*;
    use crate::error::AmountError;

    fn write(user: &str, amount: &str, key: &str) -> LedgerWrite {
        LedgerWrite {
            app_id: "app".into(),
            user_id: user.into(),
            asset: "USDI".into(),
            amount: Amount::parse(amount).unwrap(),
            ref_id: "ref".into(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_credit_once_is_idempotent() {
        let store = InMemoryLedgerStore::new();
        let ledger = Ledger::new(Arc::new(store.clone()));

        let first = ledger.credit_once(write("bob", "5", "k1")).await.unwrap();
        assert!(first.applied);

        let second = ledger.credit_once(write("bob", "5", "k1")).await.unwrap();
        assert!(!second.applied);
        assert_eq!(second.entry, first.entry);

        assert_eq!(store.len().await, 1);
        assert_eq!(ledger.get_balance("app", "bob", "USDI").await.unwrap().to_string(), "5");
    }

    #[tokio::test]
    async fn test_concurrent_writers_apply_once() {
        let ledger = Arc::new(Ledger::new(Arc::new(InMemoryLedgerStore::new())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.credit_once(write("bob", "1.5", "race")).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(ledger.get_balance("app", "bob", "USDI").await.unwrap().to_string(), "1.5");
    }

    #[tokio::test]
    async fn test_balance_is_exact_decimal() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));

        ledger.credit_once(write("alice", "10.50", "c1")).await.unwrap();
        ledger.debit_once(write("alice", "3.25", "d1")).await.unwrap();

        let balance = ledger.get_balance("app", "alice", "USDI").await.unwrap();
        assert_eq!(balance.to_string(), "7.25");
    }

    #[tokio::test]
    async fn test_unknown_account_balance_is_zero() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));
        let balance = ledger.get_balance("app", "nobody", "USDI").await.unwrap();
        assert_eq!(balance.to_string(), "0");
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));

        let err = ledger.credit_once(write("bob", "0", "zero")).await.unwrap_err();
        assert!(matches!(err, AppError::Amount(AmountError::NotPositive(_))));

        let err = ledger.debit_once(write("bob", "-1", "neg")).await.unwrap_err();
        assert!(matches!(err, AppError::Amount(AmountError::NotPositive(_))));
    }

    #[test]
    fn test_idempotency_key_conventions() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            settlement_credit_key(id),
            "settlement:tip_intent:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            withdrawal_debit_key(id),
            "withdrawal:debit:00000000-0000-0000-0000-000000000000"
        );
    }
}
