use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::repository::LedgerStore;
use crate::error::AppResult;

#[derive(Default)]
struct Journal {
    entries: Vec<LedgerEntry>,
    by_key: HashMap<String, usize>,
}

/// In-memory ledger journal for development runs and tests.
/// The idempotency key index is checked and written under one lock, which
/// gives the same guarantee as the unique constraint in Postgres.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    journal: Arc<RwLock<Journal>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.journal.read().await.entries.len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_entry(&self, entry: NewLedgerEntry) -> AppResult<InsertOutcome> {
        let mut journal = self.journal.write().await;
        if journal.by_key.contains_key(&entry.write.idempotency_key) {
            return Ok(InsertOutcome::DuplicateKey);
        }

        let NewLedgerEntry { write, entry_type } = entry;
        let stored = LedgerEntry {
            id: Uuid::new_v4(),
            app_id: write.app_id,
            user_id: write.user_id,
            asset: write.asset,
            amount: write.amount,
            entry_type,
            ref_id: write.ref_id,
            idempotency_key: write.idempotency_key,
            created_at: Utc::now(),
        };

        let index = journal.entries.len();
        journal.by_key.insert(stored.idempotency_key.clone(), index);
        journal.entries.push(stored.clone());

        Ok(InsertOutcome::Inserted(stored))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntry>> {
        let journal = self.journal.read().await;
        Ok(journal
            .by_key
            .get(key)
            .map(|&index| journal.entries[index].clone()))
    }

    async fn list_entries_for_account(
        &self,
        app_id: &str,
        user_id: &str,
        asset: &str,
    ) -> AppResult<Vec<LedgerEntry>> {
        let journal = self.journal.read().await;
        Ok(journal
            .entries
            .iter()
            .filter(|e| e.app_id == app_id && e.user_id == user_id && e.asset == asset)
            .cloned()
            .collect())
    }
}
