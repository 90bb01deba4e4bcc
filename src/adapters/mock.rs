use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::traits::*;
use crate::error::AdapterError;

#[derive(Default)]
struct MockNetwork {
    invoices: HashMap<String, ObservedInvoiceState>,
    status_errors: HashMap<String, AdapterError>,
    withdrawal_results: VecDeque<Result<String, AdapterError>>,
    listeners: Vec<(u64, Arc<dyn SettlementListener>)>,
}

/// Scriptable in-memory payment network for development and tests.
///
/// Invoices start UNPAID. Withdrawals succeed with a generated hash unless
/// a result was queued.
#[derive(Clone, Default)]
pub struct MockSettlementAdapter {
    network: Arc<Mutex<MockNetwork>>,
    status_calls: Arc<AtomicUsize>,
    next_listener_id: Arc<AtomicU64>,
}

impl MockSettlementAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_invoice_state(&self, invoice: &str, state: ObservedInvoiceState) {
        self.network
            .lock()
            .invoices
            .insert(invoice.to_string(), state);
    }

    /// Every status call for `invoice` fails with `error` until cleared
    pub fn fail_status(&self, invoice: &str, error: AdapterError) {
        self.network
            .lock()
            .status_errors
            .insert(invoice.to_string(), error);
    }

    pub fn clear_status_error(&self, invoice: &str) {
        self.network.lock().status_errors.remove(invoice);
    }

    pub fn queue_withdrawal_result(&self, result: Result<String, AdapterError>) {
        self.network.lock().withdrawal_results.push_back(result);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.network.lock().listeners.len()
    }

    /// Marks the invoice paid and notifies every live subscriber
    pub fn push_settled(&self, invoice: &str) {
        let listeners: Vec<Arc<dyn SettlementListener>> = {
            let mut network = self.network.lock();
            network
                .invoices
                .insert(invoice.to_string(), ObservedInvoiceState::Settled);
            network.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener.on_settled(invoice.to_string());
        }
    }
}

#[async_trait]
impl SettlementAdapter for MockSettlementAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> AdapterResult<CreatedInvoice> {
        let invoice = format!("mock-inv-{}", Uuid::new_v4().simple());
        debug!(invoice = %invoice, amount = %request.amount, asset = %request.asset, "Mock invoice created");
        self.set_invoice_state(&invoice, ObservedInvoiceState::Unpaid);
        Ok(CreatedInvoice { invoice })
    }

    async fn get_invoice_status(&self, invoice: &str) -> AdapterResult<ObservedInvoiceState> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let network = self.network.lock();
        if let Some(error) = network.status_errors.get(invoice) {
            return Err(error.clone());
        }
        network
            .invoices
            .get(invoice)
            .cloned()
            .ok_or_else(|| AdapterError::Rpc {
                code: -32602,
                message: format!("unknown invoice {}", invoice),
            })
    }

    async fn subscribe_settlements(
        &self,
        listener: Arc<dyn SettlementListener>,
    ) -> AdapterResult<SubscriptionHandle> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.network.lock().listeners.push((id, listener));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let network = self.network.clone();
        let task = tokio::spawn(async move {
            // Resolves on close() or when the handle is dropped
            let _ = shutdown_rx.changed().await;
            network.lock().listeners.retain(|(lid, _)| *lid != id);
        });

        Ok(SubscriptionHandle::new(shutdown_tx, task))
    }

    async fn execute_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> AdapterResult<WithdrawalReceipt> {
        let scripted = self.network.lock().withdrawal_results.pop_front();
        match scripted {
            Some(Ok(tx_hash)) => Ok(WithdrawalReceipt { tx_hash }),
            Some(Err(error)) => Err(error),
            None => Ok(WithdrawalReceipt {
                tx_hash: format!("mock-tx-{}", request.withdrawal_id.simple()),
            }),
        }
    }
}
