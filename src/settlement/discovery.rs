//! Polling reconciliation of UNPAID tip intents against the payment network.
//!
//! A scan walks UNPAID intents in `(created_at, id)` order from the cursor,
//! wrapping to the beginning when it runs off the end, so every intent is
//! revisited within a bounded number of scans. Per-intent failures are
//! counted, never propagated: one bad intent does not abort a scan.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::models::*;
use super::{apply_settlement, Clock};
use crate::adapters::{ObservedInvoiceState, SettlementAdapter};
use crate::error::{AdapterError, AppResult, FailureClass};
use crate::ledger::Ledger;
use crate::tips::{InvoiceState, TipIntent, TipIntentQuery, TipIntentStore};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub limit: usize,
    pub app_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub cursor: Option<SettlementCursor>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub pending_timeout: Duration,
}

impl ScanOptions {
    fn query(&self, after: Option<(DateTime<Utc>, Uuid)>) -> TipIntentQuery {
        TipIntentQuery {
            state: InvoiceState::Unpaid,
            app_id: self.app_id.clone(),
            created_from: self.created_from,
            created_to: self.created_to,
            after,
            limit: self.limit,
        }
    }
}

pub struct SettlementDiscovery {
    adapter: Arc<dyn SettlementAdapter>,
    tips: Arc<dyn TipIntentStore>,
    ledger: Arc<Ledger>,
    clock: Clock,
}

impl SettlementDiscovery {
    pub fn new(
        adapter: Arc<dyn SettlementAdapter>,
        tips: Arc<dyn TipIntentStore>,
        ledger: Arc<Ledger>,
        clock: Clock,
    ) -> Self {
        Self {
            adapter,
            tips,
            ledger,
            clock,
        }
    }

    #[instrument(skip(self, options), fields(limit = options.limit, app_id = ?options.app_id))]
    pub async fn scan(&self, options: &ScanOptions) -> AppResult<ScanResult> {
        let now = (self.clock)();
        let backlog_before = self.tips.count_by_invoice_state(&options.query(None)).await?;

        let page = self.fetch_page(options).await?;

        let mut summary = ScanSummary {
            scanned: page.len(),
            next_cursor: page.last().map(|intent| SettlementCursor {
                id: intent.id,
                created_at: intent.created_at,
            }),
            backlog_unpaid_before_scan: backlog_before,
            ..Default::default()
        };
        let mut events = Vec::new();
        let mut latencies = Vec::new();

        for intent in &page {
            if intent.is_retry_pending(now) {
                summary.skipped_retry_pending += 1;
                continue;
            }

            match self.reconcile(intent, now, options).await {
                Ok(event) => {
                    if event.outcome == SettlementOutcome::SettledCreditApplied {
                        latencies.push((now - intent.created_at).num_milliseconds());
                    }
                    log_event(&event);
                    summary.record(&event);
                    events.push(event);
                }
                Err(e) => {
                    summary.errors += 1;
                    error!(
                        tip_intent_id = %intent.id,
                        invoice = %intent.invoice,
                        "Settlement reconcile failed, intent left for the next scan: {}",
                        e
                    );
                }
            }
        }

        summary.detection_latency_ms = LatencySummary::from_samples(latencies);
        summary.backlog_unpaid_after_scan =
            self.tips.count_by_invoice_state(&options.query(None)).await?;

        info!(
            scanned = summary.scanned,
            settled_credits = summary.settled_credits,
            settled_duplicates = summary.settled_duplicates,
            failed = summary.failed,
            still_unpaid = summary.still_unpaid,
            retry_scheduled = summary.retry_scheduled,
            skipped_retry_pending = summary.skipped_retry_pending,
            errors = summary.errors,
            backlog = summary.backlog_unpaid_after_scan,
            "Settlement scan finished"
        );

        Ok(ScanResult { summary, events })
    }

    /// Page after the cursor, topped up from the beginning when short
    async fn fetch_page(&self, options: &ScanOptions) -> AppResult<Vec<TipIntent>> {
        let after = options.cursor.as_ref().map(SettlementCursor::as_keyset);
        let mut page = self.tips.list_by_invoice_state(&options.query(after)).await?;

        if after.is_some() && page.len() < options.limit {
            let seen: HashSet<Uuid> = page.iter().map(|intent| intent.id).collect();
            let head = self.tips.list_by_invoice_state(&options.query(None)).await?;
            let missing = options.limit - page.len();
            page.extend(
                head.into_iter()
                    .filter(|intent| !seen.contains(&intent.id))
                    .take(missing),
            );
        }

        Ok(page)
    }

    async fn reconcile(
        &self,
        intent: &TipIntent,
        now: DateTime<Utc>,
        options: &ScanOptions,
    ) -> AppResult<SettlementUpdateEvent> {
        let observed = match self.adapter.get_invoice_status(&intent.invoice).await {
            Ok(observed) => observed,
            Err(e) => return self.handle_adapter_error(intent, e, now, options).await,
        };

        let mut event = SettlementUpdateEvent {
            invoice: intent.invoice.clone(),
            previous_state: intent.invoice_state,
            observed_state: Some(observed.as_str().to_string()),
            next_state: intent.invoice_state,
            outcome: SettlementOutcome::NoChange,
            ledger_credit_applied: false,
            failure_class: None,
            retry_count: None,
            next_retry_at: None,
            error: None,
        };

        match observed {
            ObservedInvoiceState::Settled => {
                let applied =
                    apply_settlement(&self.ledger, self.tips.as_ref(), intent, now).await?;
                event.next_state = applied.intent.invoice_state;
                event.ledger_credit_applied = applied.credit_applied;
                event.outcome = if applied.credit_applied {
                    SettlementOutcome::SettledCreditApplied
                } else {
                    SettlementOutcome::SettledDuplicate
                };
            }
            ObservedInvoiceState::Failed => {
                self.fail(intent, &mut event, SettlementOutcome::FailedUpstreamReported, now)
                    .await?;
            }
            ObservedInvoiceState::Unpaid if now - intent.created_at > options.pending_timeout => {
                let reason = format!(
                    "invoice unpaid after {}ms",
                    options.pending_timeout.num_milliseconds()
                );
                event.failure_class = Some(FailureClass::Terminal);
                event.error = Some(reason);
                self.fail(intent, &mut event, SettlementOutcome::FailedPendingTimeout, now)
                    .await?;
            }
            ObservedInvoiceState::Unpaid => {
                self.tips.mark_settlement_checked(intent.id, now).await?;
            }
            ObservedInvoiceState::Unrecognized(raw) => {
                event.failure_class = Some(FailureClass::Terminal);
                event.error = Some(format!("unexpected invoice state {:?}", raw));
                self.fail(intent, &mut event, SettlementOutcome::FailedContractMismatch, now)
                    .await?;
            }
        }

        Ok(event)
    }

    async fn handle_adapter_error(
        &self,
        intent: &TipIntent,
        error: AdapterError,
        now: DateTime<Utc>,
        options: &ScanOptions,
    ) -> AppResult<SettlementUpdateEvent> {
        let message = error.to_string();
        let class = error.failure_class();

        let mut event = SettlementUpdateEvent {
            invoice: intent.invoice.clone(),
            previous_state: intent.invoice_state,
            observed_state: None,
            next_state: intent.invoice_state,
            outcome: SettlementOutcome::RetryScheduledTransient,
            ledger_credit_applied: false,
            failure_class: Some(class),
            retry_count: None,
            next_retry_at: None,
            error: Some(message.clone()),
        };

        if class == FailureClass::Terminal {
            self.fail(intent, &mut event, SettlementOutcome::FailedTerminalError, now)
                .await?;
            return Ok(event);
        }

        let bumped = self
            .tips
            .increment_settlement_retry(intent.id, &message, now)
            .await?;
        event.retry_count = Some(bumped.settlement_retry_count);

        if bumped.settlement_retry_count.max(0) as u32 > options.max_retries {
            self.fail(intent, &mut event, SettlementOutcome::FailedRetryExhausted, now)
                .await?;
        } else {
            let next_retry_at = now + options.retry_delay;
            self.tips
                .schedule_settlement_retry(intent.id, next_retry_at)
                .await?;
            event.next_retry_at = Some(next_retry_at);
        }

        Ok(event)
    }

    /// Moves the intent to FAILED and records the event's error. If a
    /// concurrent path settled the intent first, the stored SETTLED state
    /// wins and the event reports a duplicate settlement instead.
    async fn fail(
        &self,
        intent: &TipIntent,
        event: &mut SettlementUpdateEvent,
        outcome: SettlementOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let updated = self
            .tips
            .update_invoice_state(intent.id, InvoiceState::Failed, now)
            .await?;
        event.next_state = updated.invoice_state;

        if updated.invoice_state == InvoiceState::Settled {
            event.outcome = SettlementOutcome::SettledDuplicate;
            event.failure_class = None;
            return Ok(());
        }

        self.tips
            .record_settlement_failure(intent.id, outcome.as_str(), event.error.as_deref(), now)
            .await?;
        event.outcome = outcome;
        Ok(())
    }
}

fn log_event(event: &SettlementUpdateEvent) {
    if event.outcome.is_terminal_failure() {
        warn!(
            invoice = %event.invoice,
            outcome = %event.outcome,
            observed_state = ?event.observed_state,
            error = ?event.error,
            "Settlement update"
        );
    } else {
        info!(
            invoice = %event.invoice,
            outcome = %event.outcome,
            previous_state = %event.previous_state,
            next_state = %event.next_state,
            ledger_credit_applied = event.ledger_credit_applied,
            retry_count = ?event.retry_count,
            "Settlement update"
        );
    }
}
