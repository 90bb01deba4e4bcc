use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::models::Withdrawal;
use super::repository::WithdrawalStore;
use crate::adapters::{SettlementAdapter, WithdrawalRequest};
use crate::error::{AppError, AppResult, FailureClass, WithdrawalError};
use crate::ledger::models::{withdrawal_debit_key, LedgerWrite};
use crate::ledger::Ledger;

/// Result of handing one withdrawal to the payment network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { tx_hash: String },
    TransientFailure { error: String },
    PermanentFailure { error: String },
}

/// Sends withdrawals out. Errors are treated as transient failures.
#[async_trait]
pub trait WithdrawalExecutor: Send + Sync {
    async fn execute(&self, withdrawal: &Withdrawal) -> AppResult<ExecutionOutcome>;
}

/// Executor backed by the settlement adapter
pub struct AdapterWithdrawalExecutor {
    adapter: Arc<dyn SettlementAdapter>,
}

impl AdapterWithdrawalExecutor {
    pub fn new(adapter: Arc<dyn SettlementAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl WithdrawalExecutor for AdapterWithdrawalExecutor {
    async fn execute(&self, withdrawal: &Withdrawal) -> AppResult<ExecutionOutcome> {
        let request = WithdrawalRequest {
            withdrawal_id: withdrawal.id,
            asset: withdrawal.asset.clone(),
            amount: withdrawal.amount.clone(),
            to_address: withdrawal.to_address.clone(),
        };

        match self.adapter.execute_withdrawal(request).await {
            Ok(receipt) => Ok(ExecutionOutcome::Success {
                tx_hash: receipt.tx_hash,
            }),
            Err(e) => Ok(match e.failure_class() {
                FailureClass::Terminal => ExecutionOutcome::PermanentFailure {
                    error: e.to_string(),
                },
                FailureClass::Transient => ExecutionOutcome::TransientFailure {
                    error: e.to_string(),
                },
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// Counters for one batch
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub picked: usize,
    pub completed: Vec<Withdrawal>,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Outcome of one pass over COMPLETED withdrawals awaiting their debit
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebitSweep {
    pub applied: usize,
    pub replayed: usize,
    pub errors: usize,
}

pub struct WithdrawalProcessor {
    store: Arc<dyn WithdrawalStore>,
    executor: Arc<dyn WithdrawalExecutor>,
    config: ProcessorConfig,
}

impl WithdrawalProcessor {
    pub fn new(
        store: Arc<dyn WithdrawalStore>,
        executor: Arc<dyn WithdrawalExecutor>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Process one batch of ready withdrawals.
    ///
    /// Only the initial listing can fail the batch; per-item failures are
    /// counted and the batch moves on.
    #[instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn process_batch(&self, now: DateTime<Utc>) -> AppResult<BatchSummary> {
        let ready = self
            .store
            .list_ready_for_processing(now, self.config.batch_size)
            .await?;

        let mut summary = BatchSummary {
            picked: ready.len(),
            ..Default::default()
        };

        for withdrawal in ready {
            if let Err(e) = self.process_one(&withdrawal, now, &mut summary).await {
                summary.errors += 1;
                error!(withdrawal_id = %withdrawal.id, "Withdrawal processing failed: {}", e);
            }
        }

        if summary.picked > 0 {
            info!(
                picked = summary.picked,
                completed = summary.completed.len(),
                retry_scheduled = summary.retry_scheduled,
                failed = summary.failed,
                conflicts = summary.conflicts,
                errors = summary.errors,
                "Withdrawal batch processed"
            );
        }

        Ok(summary)
    }

    /// Debit the ledger for every COMPLETED withdrawal not yet debited.
    ///
    /// The debit is keyed by withdrawal id, so a withdrawal whose debit
    /// landed but whose `debited_at` write failed is replayed harmlessly on
    /// the next pass. Failures leave the record for the next pass.
    #[instrument(skip(self, ledger))]
    pub async fn apply_debits(&self, ledger: &Ledger, now: DateTime<Utc>) -> AppResult<DebitSweep> {
        let awaiting = self.store.list_awaiting_debit(self.config.batch_size).await?;
        let mut sweep = DebitSweep::default();

        for withdrawal in awaiting {
            let debit = LedgerWrite {
                app_id: withdrawal.app_id.clone(),
                user_id: withdrawal.user_id.clone(),
                asset: withdrawal.asset.clone(),
                amount: withdrawal.amount.clone(),
                ref_id: withdrawal.id.to_string(),
                idempotency_key: withdrawal_debit_key(withdrawal.id),
            };

            let result = match ledger.debit_once(debit).await {
                Ok(outcome) => self
                    .store
                    .mark_debited(withdrawal.id, now)
                    .await
                    .map(|_| outcome.applied),
                Err(e) => Err(e),
            };

            match result {
                Ok(true) => sweep.applied += 1,
                Ok(false) => sweep.replayed += 1,
                Err(e) => {
                    sweep.errors += 1;
                    error!(
                        withdrawal_id = %withdrawal.id,
                        "Withdrawal debit failed, retrying next pass: {}",
                        e
                    );
                }
            }
        }

        if sweep != DebitSweep::default() {
            info!(
                applied = sweep.applied,
                replayed = sweep.replayed,
                errors = sweep.errors,
                "Withdrawal debits swept"
            );
        }

        Ok(sweep)
    }

    async fn process_one(
        &self,
        withdrawal: &Withdrawal,
        now: DateTime<Utc>,
        summary: &mut BatchSummary,
    ) -> AppResult<()> {
        let claimed = match self.store.mark_processing(withdrawal.id, now).await {
            Ok(claimed) => claimed,
            Err(AppError::Withdrawal(WithdrawalError::TransitionConflict { actual, .. })) => {
                debug!(
                    withdrawal_id = %withdrawal.id,
                    state = %actual,
                    "Withdrawal claimed elsewhere, skipping"
                );
                summary.conflicts += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = match self.executor.execute(&claimed).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::TransientFailure {
                error: e.to_string(),
            },
        };

        match outcome {
            ExecutionOutcome::Success { tx_hash } => {
                let completed = self.store.mark_completed(claimed.id, &tx_hash, now).await?;
                info!(withdrawal_id = %completed.id, tx_hash = %tx_hash, "Withdrawal completed");
                summary.completed.push(completed);
            }
            ExecutionOutcome::TransientFailure { error } => {
                let attempts = claimed.retry_count.max(0) as u32 + 1;
                if attempts >= self.config.max_retries {
                    self.store.mark_failed(claimed.id, &error, true, now).await?;
                    warn!(
                        withdrawal_id = %claimed.id,
                        attempts,
                        "Withdrawal failed, retry budget exhausted: {}",
                        error
                    );
                    summary.failed += 1;
                } else {
                    let next_retry_at = now + self.config.retry_delay;
                    self.store
                        .mark_retry_pending(claimed.id, &error, next_retry_at, now)
                        .await?;
                    warn!(
                        withdrawal_id = %claimed.id,
                        attempts,
                        next_retry_at = %next_retry_at,
                        "Withdrawal retry scheduled: {}",
                        error
                    );
                    summary.retry_scheduled += 1;
                }
            }
            ExecutionOutcome::PermanentFailure { error } => {
                self.store.mark_failed(claimed.id, &error, false, now).await?;
                warn!(withdrawal_id = %claimed.id, "Withdrawal rejected: {}", error);
                summary.failed += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockSettlementAdapter;
    use crate::amount::Amount;
    use crate::error::AdapterError;
    use crate::ledger::memory::InMemoryLedgerStore;
    use crate::withdrawals::memory::InMemoryWithdrawalStore;
    use crate::withdrawals::models::{NewWithdrawal, WithdrawalState};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed list of outcomes
    struct ScriptedExecutor {
        outcomes: Mutex<VecDeque<AppResult<ExecutionOutcome>>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<AppResult<ExecutionOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl WithdrawalExecutor for ScriptedExecutor {
        async fn execute(&self, _withdrawal: &Withdrawal) -> AppResult<ExecutionOutcome> {
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Internal("no scripted outcome".into())))
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn config(max_retries: u32) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: 10,
            max_retries,
            retry_delay: Duration::minutes(1),
        }
    }

    async fn seed(store: &InMemoryWithdrawalStore) -> Withdrawal {
        store
            .create(
                NewWithdrawal {
                    app_id: "app".into(),
                    user_id: "bob".into(),
                    asset: "USDI".into(),
                    amount: Amount::parse("4").unwrap(),
                    to_address: "addr-bob".into(),
                },
                at(0),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_and_returns_record() {
        let store = InMemoryWithdrawalStore::new();
        let withdrawal = seed(&store).await;
        let executor = ScriptedExecutor::new(vec![Ok(ExecutionOutcome::Success {
            tx_hash: "0xabc".into(),
        })]);
        let processor = WithdrawalProcessor::new(Arc::new(store.clone()), executor, config(3));

        let summary = processor.process_batch(at(1)).await.unwrap();
        assert_eq!(summary.picked, 1);
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(summary.completed[0].id, withdrawal.id);
        assert_eq!(summary.completed[0].tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_budget() {
        let store = InMemoryWithdrawalStore::new();
        let withdrawal = seed(&store).await;
        let executor = ScriptedExecutor::new(vec![
            Ok(ExecutionOutcome::TransientFailure { error: "busy".into() }),
            Err(AppError::Internal("socket closed".into())),
        ]);
        let processor = WithdrawalProcessor::new(Arc::new(store.clone()), executor, config(2));

        let first = processor.process_batch(at(1)).await.unwrap();
        assert_eq!(first.retry_scheduled, 1);
        let pending = store.find_by_id(withdrawal.id).await.unwrap().unwrap();
        assert_eq!(pending.state, WithdrawalState::RetryPending);
        assert_eq!(pending.retry_count, 1);
        assert_eq!(pending.next_retry_at, Some(at(2)));

        // Not due yet
        let idle = processor.process_batch(at(1)).await.unwrap();
        assert_eq!(idle.picked, 0);

        let second = processor.process_batch(at(2)).await.unwrap();
        assert_eq!(second.failed, 1);
        let failed = store.find_by_id(withdrawal.id).await.unwrap().unwrap();
        assert_eq!(failed.state, WithdrawalState::Failed);
        assert_eq!(failed.retry_count, 2);
        assert!(failed.last_error.unwrap().contains("socket closed"));
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_retry_count() {
        let store = InMemoryWithdrawalStore::new();
        let withdrawal = seed(&store).await;
        let executor = ScriptedExecutor::new(vec![Ok(ExecutionOutcome::PermanentFailure {
            error: "bad address".into(),
        })]);
        let processor = WithdrawalProcessor::new(Arc::new(store.clone()), executor, config(5));

        let summary = processor.process_batch(at(1)).await.unwrap();
        assert_eq!(summary.failed, 1);
        let failed = store.find_by_id(withdrawal.id).await.unwrap().unwrap();
        assert_eq!(failed.state, WithdrawalState::Failed);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.last_error.as_deref(), Some("bad address"));
    }

    #[tokio::test]
    async fn test_adapter_executor_maps_failure_classes() {
        let store = InMemoryWithdrawalStore::new();
        let withdrawal = seed(&store).await;
        let adapter = Arc::new(MockSettlementAdapter::new());
        let executor = AdapterWithdrawalExecutor::new(adapter.clone());

        adapter.queue_withdrawal_result(Err(AdapterError::Http {
            status: 400,
            message: "bad address".into(),
        }));
        adapter.queue_withdrawal_result(Err(AdapterError::Timeout));
        adapter.queue_withdrawal_result(Ok("0xfeed".into()));

        assert!(matches!(
            executor.execute(&withdrawal).await.unwrap(),
            ExecutionOutcome::PermanentFailure { .. }
        ));
        assert!(matches!(
            executor.execute(&withdrawal).await.unwrap(),
            ExecutionOutcome::TransientFailure { .. }
        ));
        assert_eq!(
            executor.execute(&withdrawal).await.unwrap(),
            ExecutionOutcome::Success {
                tx_hash: "0xfeed".into()
            }
        );
    }

    #[tokio::test]
    async fn test_apply_debits_marks_and_replays() {
        let store = InMemoryWithdrawalStore::new();
        let withdrawal = seed(&store).await;
        let executor = ScriptedExecutor::new(vec![Ok(ExecutionOutcome::Success {
            tx_hash: "0xabc".into(),
        })]);
        let processor = WithdrawalProcessor::new(Arc::new(store.clone()), executor, config(3));
        let ledger_store = InMemoryLedgerStore::new();
        let ledger = Ledger::new(Arc::new(ledger_store.clone()));

        processor.process_batch(at(1)).await.unwrap();

        // Debit already in the ledger from an earlier pass that died before marking
        ledger
            .debit_once(LedgerWrite {
                app_id: "app".into(),
                user_id: "bob".into(),
                asset: "USDI".into(),
                amount: Amount::parse("4").unwrap(),
                ref_id: withdrawal.id.to_string(),
                idempotency_key: withdrawal_debit_key(withdrawal.id),
            })
            .await
            .unwrap();

        let sweep = processor.apply_debits(&ledger, at(2)).await.unwrap();
        assert_eq!(
            sweep,
            DebitSweep {
                applied: 0,
                replayed: 1,
                errors: 0
            }
        );
        assert_eq!(ledger_store.len().await, 1);

        let debited = store.find_by_id(withdrawal.id).await.unwrap().unwrap();
        assert_eq!(debited.debited_at, Some(at(2)));
        assert_eq!(
            processor.apply_debits(&ledger, at(3)).await.unwrap(),
            DebitSweep::default()
        );
        assert_eq!(ledger.get_balance("app", "bob", "USDI").await.unwrap().to_string(), "-4");
    }
}
