use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::amount::Amount;
use crate::error::AdapterError;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub app_id: String,
    pub asset: String,
    pub amount: Amount,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub invoice: String,
}

/// Invoice state as reported by the payment network.
/// Anything outside the known set is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedInvoiceState {
    Unpaid,
    Settled,
    Failed,
    Unrecognized(String),
}

impl ObservedInvoiceState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "UNPAID" => ObservedInvoiceState::Unpaid,
            "SETTLED" => ObservedInvoiceState::Settled,
            "FAILED" => ObservedInvoiceState::Failed,
            _ => ObservedInvoiceState::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ObservedInvoiceState::Unpaid => "UNPAID",
            ObservedInvoiceState::Settled => "SETTLED",
            ObservedInvoiceState::Failed => "FAILED",
            ObservedInvoiceState::Unrecognized(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub withdrawal_id: Uuid,
    pub asset: String,
    pub amount: Amount,
    pub to_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub tx_hash: String,
}

/// Receives push notifications. Called from the adapter's stream task,
/// so implementations must not block.
pub trait SettlementListener: Send + Sync {
    fn on_settled(&self, invoice: String);

    fn on_error(&self, error: AdapterError);
}

/// Live push subscription. Dropping the handle leaves the task running;
/// call `close` to stop it.
pub struct SubscriptionHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(shutdown_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { shutdown_tx, task }
    }

    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!("Settlement subscription task panicked: {}", e);
            }
        }
    }
}

/// Payment network client
#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_invoice(&self, request: InvoiceRequest) -> AdapterResult<CreatedInvoice>;

    async fn get_invoice_status(&self, invoice: &str) -> AdapterResult<ObservedInvoiceState>;

    async fn subscribe_settlements(
        &self,
        listener: Arc<dyn SettlementListener>,
    ) -> AdapterResult<SubscriptionHandle>;

    async fn execute_withdrawal(&self, request: WithdrawalRequest)
        -> AdapterResult<WithdrawalReceipt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_state_parsing() {
        assert_eq!(ObservedInvoiceState::parse("settled"), ObservedInvoiceState::Settled);
        assert_eq!(ObservedInvoiceState::parse("UNPAID"), ObservedInvoiceState::Unpaid);
        assert_eq!(ObservedInvoiceState::parse("Failed"), ObservedInvoiceState::Failed);
        assert_eq!(
            ObservedInvoiceState::parse("HELD"),
            ObservedInvoiceState::Unrecognized("HELD".into())
        );
        assert_eq!(ObservedInvoiceState::parse("HELD").as_str(), "HELD");
    }
}
