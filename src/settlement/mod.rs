// Settlement: polling discovery, push subscription and the worker runtime.
// Both paths credit through `apply_settlement`, so they converge on the
// same idempotency key.
pub mod cursor;
pub mod discovery;
pub mod models;
pub mod scheduler;
pub mod subscription;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::AppResult;
use crate::ledger::models::{settlement_credit_key, LedgerWrite};
use crate::ledger::Ledger;
use crate::tips::{InvoiceState, TipIntent, TipIntentStore};

pub use cursor::CursorStore;
pub use discovery::{ScanOptions, SettlementDiscovery};
pub use models::*;
pub use scheduler::{ShutdownOutcome, WorkerRuntime, WorkerSchedule};
pub use subscription::{SubscriptionRunner, SubscriptionRunnerConfig};

/// Injectable time source
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone)]
pub struct SettlementApplied {
    pub intent: TipIntent,
    pub credit_applied: bool,
}

/// Credit the recipient once, then mark the intent SETTLED.
///
/// The credit goes first: if the state write fails, the next observation
/// finds the credit already present and only repeats the state write.
pub async fn apply_settlement(
    ledger: &Ledger,
    tips: &dyn TipIntentStore,
    intent: &TipIntent,
    now: DateTime<Utc>,
) -> AppResult<SettlementApplied> {
    let credit = ledger
        .credit_once(LedgerWrite {
            app_id: intent.app_id.clone(),
            user_id: intent.to_user_id.clone(),
            asset: intent.asset.clone(),
            amount: intent.amount.clone(),
            ref_id: intent.id.to_string(),
            idempotency_key: settlement_credit_key(intent.id),
        })
        .await?;

    let settled = tips
        .update_invoice_state(intent.id, InvoiceState::Settled, now)
        .await?;

    if credit.applied {
        info!(
            tip_intent_id = %intent.id,
            invoice = %intent.invoice,
            to_user_id = %intent.to_user_id,
            amount = %intent.amount,
            asset = %intent.asset,
            "Settlement credited"
        );
    }

    Ok(SettlementApplied {
        intent: settled,
        credit_applied: credit.applied,
    })
}

/// Push-path entry: resolve the invoice, then apply the settlement
pub async fn settle_invoice(
    ledger: &Ledger,
    tips: &dyn TipIntentStore,
    invoice: &str,
    now: DateTime<Utc>,
) -> AppResult<SettlementApplied> {
    let intent = tips.find_by_invoice_or_throw(invoice).await?;
    apply_settlement(ledger, tips, &intent, now).await
}
