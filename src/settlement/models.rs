use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::FailureClass;
use crate::tips::InvoiceState;

/// Keyset position of the last scanned tip intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementCursor {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl SettlementCursor {
    pub fn as_keyset(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Per-intent result of one reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementOutcome {
    SettledCreditApplied,
    SettledDuplicate,
    FailedUpstreamReported,
    FailedPendingTimeout,
    FailedContractMismatch,
    FailedRetryExhausted,
    FailedTerminalError,
    RetryScheduledTransient,
    NoChange,
}

impl SettlementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOutcome::SettledCreditApplied => "SETTLED_CREDIT_APPLIED",
            SettlementOutcome::SettledDuplicate => "SETTLED_DUPLICATE",
            SettlementOutcome::FailedUpstreamReported => "FAILED_UPSTREAM_REPORTED",
            SettlementOutcome::FailedPendingTimeout => "FAILED_PENDING_TIMEOUT",
            SettlementOutcome::FailedContractMismatch => "FAILED_CONTRACT_MISMATCH",
            SettlementOutcome::FailedRetryExhausted => "FAILED_RETRY_EXHAUSTED",
            SettlementOutcome::FailedTerminalError => "FAILED_TERMINAL_ERROR",
            SettlementOutcome::RetryScheduledTransient => "RETRY_SCHEDULED_TRANSIENT",
            SettlementOutcome::NoChange => "NO_CHANGE",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SettlementOutcome::FailedUpstreamReported
                | SettlementOutcome::FailedPendingTimeout
                | SettlementOutcome::FailedContractMismatch
                | SettlementOutcome::FailedRetryExhausted
                | SettlementOutcome::FailedTerminalError
        )
    }

    /// Reconciliation gave up. Upstream FAILED reports are not included.
    pub fn is_terminal_failure(&self) -> bool {
        self.is_failure() && *self != SettlementOutcome::FailedUpstreamReported
    }
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementUpdateEvent {
    pub invoice: String,
    pub previous_state: InvoiceState,
    /// Raw upstream state; `None` when the adapter call failed
    pub observed_state: Option<String>,
    pub next_state: InvoiceState,
    pub outcome: SettlementOutcome,
    pub ledger_credit_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Nearest-rank percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50: Option<i64>,
    pub p95: Option<i64>,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<i64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        Self {
            count: samples.len(),
            p50: Some(nearest_rank(&samples, 50)),
            p95: Some(nearest_rank(&samples, 95)),
        }
    }
}

fn nearest_rank(sorted: &[i64], percentile: usize) -> i64 {
    let rank = (percentile * sorted.len() + 99) / 100;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scanned: usize,
    pub settled_credits: usize,
    pub settled_duplicates: usize,
    pub failed: usize,
    pub still_unpaid: usize,
    pub errors: usize,
    pub retry_scheduled: usize,
    pub terminal_failures: usize,
    pub skipped_retry_pending: usize,
    pub next_cursor: Option<SettlementCursor>,
    pub backlog_unpaid_before_scan: u64,
    pub backlog_unpaid_after_scan: u64,
    pub detection_latency_ms: LatencySummary,
}

impl ScanSummary {
    pub fn record(&mut self, event: &SettlementUpdateEvent) {
        match event.outcome {
            SettlementOutcome::SettledCreditApplied => self.settled_credits += 1,
            SettlementOutcome::SettledDuplicate => self.settled_duplicates += 1,
            SettlementOutcome::RetryScheduledTransient => {
                self.retry_scheduled += 1;
                self.still_unpaid += 1;
            }
            SettlementOutcome::NoChange => self.still_unpaid += 1,
            outcome => {
                self.failed += 1;
                if outcome.is_terminal_failure() {
                    self.terminal_failures += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub summary: ScanSummary,
    pub events: Vec<SettlementUpdateEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_percentiles() {
        let summary = LatencySummary::from_samples(vec![50, 10, 40, 20, 30]);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.p50, Some(30));
        assert_eq!(summary.p95, Some(50));

        let single = LatencySummary::from_samples(vec![7]);
        assert_eq!((single.p50, single.p95), (Some(7), Some(7)));

        assert_eq!(LatencySummary::from_samples(vec![]), LatencySummary::default());
    }

    #[test]
    fn test_terminal_failures_exclude_upstream_reports() {
        assert!(SettlementOutcome::FailedUpstreamReported.is_failure());
        assert!(!SettlementOutcome::FailedUpstreamReported.is_terminal_failure());
        assert!(SettlementOutcome::FailedPendingTimeout.is_terminal_failure());
        assert!(!SettlementOutcome::NoChange.is_failure());
        assert_eq!(
            serde_json::to_string(&SettlementOutcome::RetryScheduledTransient).unwrap(),
            "\"RETRY_SCHEDULED_TRANSIENT\""
        );
    }
}
