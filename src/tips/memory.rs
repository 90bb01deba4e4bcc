use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::models::*;
use super::repository::TipIntentStore;
use crate::error::{AppResult, TipIntentError};

/// In-memory tip intent store, mirroring the Postgres semantics
#[derive(Clone, Default)]
pub struct InMemoryTipIntentStore {
    intents: Arc<RwLock<HashMap<Uuid, TipIntent>>>,
}

impl InMemoryTipIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify<F>(&self, id: Uuid, apply: F) -> AppResult<TipIntent>
    where
        F: FnOnce(&mut TipIntent) + Send,
    {
        let mut intents = self.intents.write().await;
        let intent = intents
            .get_mut(&id)
            .ok_or(TipIntentError::NotFoundById(id))?;
        apply(intent);
        Ok(intent.clone())
    }
}

#[async_trait]
impl TipIntentStore for InMemoryTipIntentStore {
    async fn create(&self, new: NewTipIntent) -> AppResult<TipIntent> {
        new.amount.assert_positive()?;

        let mut intents = self.intents.write().await;
        if intents.values().any(|i| i.invoice == new.invoice) {
            return Err(TipIntentError::DuplicateInvoice(new.invoice).into());
        }

        let intent = TipIntent {
            id: Uuid::new_v4(),
            app_id: new.app_id,
            post_id: new.post_id,
            from_user_id: new.from_user_id,
            to_user_id: new.to_user_id,
            asset: new.asset,
            amount: new.amount,
            invoice: new.invoice,
            invoice_state: InvoiceState::Unpaid,
            created_at: new.created_at,
            settled_at: None,
            settlement_retry_count: 0,
            settlement_next_retry_at: None,
            settlement_last_error: None,
            settlement_failure_reason: None,
            settlement_last_checked_at: None,
        };
        intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<TipIntent>> {
        Ok(self.intents.read().await.get(&id).cloned())
    }

    async fn find_by_invoice(&self, invoice: &str) -> AppResult<Vec<TipIntent>> {
        let intents = self.intents.read().await;
        Ok(intents
            .values()
            .filter(|i| i.invoice == invoice)
            .cloned()
            .collect())
    }

    async fn update_invoice_state(
        &self,
        id: Uuid,
        state: InvoiceState,
        now: DateTime<Utc>,
    ) -> AppResult<TipIntent> {
        let mut intents = self.intents.write().await;
        let intent = intents
            .get_mut(&id)
            .ok_or(TipIntentError::NotFoundById(id))?;

        if intent.invoice_state == state {
            return Ok(intent.clone());
        }
        if intent.invoice_state == InvoiceState::Settled {
            warn!(
                tip_intent_id = %id,
                requested = %state,
                "Ignoring state write against a settled tip intent"
            );
            return Ok(intent.clone());
        }

        intent.invoice_state = state;
        if state == InvoiceState::Settled && intent.settled_at.is_none() {
            intent.settled_at = Some(now);
        }
        Ok(intent.clone())
    }

    async fn list_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<Vec<TipIntent>> {
        let intents = self.intents.read().await;
        let mut matching: Vec<TipIntent> = intents
            .values()
            .filter(|i| query.matches(i))
            .filter(|i| query.after.map_or(true, |after| (i.created_at, i.id) > after))
            .cloned()
            .collect();

        matching.sort_by_key(|i| (i.created_at, i.id));
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn count_by_invoice_state(&self, query: &TipIntentQuery) -> AppResult<u64> {
        let intents = self.intents.read().await;
        Ok(intents.values().filter(|i| query.matches(i)).count() as u64)
    }

    async fn increment_settlement_retry(
        &self,
        id: Uuid,
        error: &str,
        checked_at: DateTime<Utc>,
    ) -> AppResult<TipIntent> {
        let error = error.to_string();
        self.modify(id, move |intent| {
            intent.settlement_retry_count += 1;
            intent.settlement_last_error = Some(error);
            intent.settlement_last_checked_at = Some(checked_at);
        })
        .await
    }

    async fn schedule_settlement_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.modify(id, move |intent| {
            intent.settlement_next_retry_at = Some(next_retry_at);
        })
        .await
        .map(|_| ())
    }

    async fn record_settlement_failure(
        &self,
        id: Uuid,
        reason: &str,
        error: Option<&str>,
        checked_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let reason = reason.to_string();
        let error = error.map(str::to_string);
        self.modify(id, move |intent| {
            intent.settlement_failure_reason = Some(reason);
            if error.is_some() {
                intent.settlement_last_error = error;
            }
            intent.settlement_next_retry_at = None;
            intent.settlement_last_checked_at = Some(checked_at);
        })
        .await
        .map(|_| ())
    }

    async fn mark_settlement_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> AppResult<()> {
        self.modify(id, move |intent| {
            intent.settlement_last_checked_at = Some(checked_at);
        })
        .await
        .map(|_| ())
    }
}
