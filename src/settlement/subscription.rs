//! Push fast path for settlements.
//!
//! Adapter callbacks land in a bounded queue drained by a fixed pool of
//! workers. When the queue is full the event is shed: polling picks the
//! invoice up on a later scan, so nothing is lost of record.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{settle_invoice, Clock};
use crate::adapters::{SettlementAdapter, SettlementListener, SubscriptionHandle};
use crate::error::{AdapterError, AppError, AppResult, TipIntentError};
use crate::ledger::Ledger;
use crate::tips::TipIntentStore;

/// Called with the invoice of every shed event
pub type OverflowCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SubscriptionRunnerConfig {
    pub concurrency: usize,
    pub max_pending_events: usize,
    /// 0 disables deduplication
    pub dedupe_window: usize,
}

impl Default for SubscriptionRunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_pending_events: 1000,
            dedupe_window: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub accepted: u64,
    pub deduplicated: u64,
    pub dropped: u64,
    pub credited: u64,
    pub duplicates: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    deduplicated: AtomicU64,
    dropped: AtomicU64,
    credited: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            credited: self.credited.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Recently accepted invoices, oldest evicted first. `contains` does not
/// refresh recency, so eviction follows acceptance order.
struct RecentInvoices {
    window: Option<LruCache<String, ()>>,
}

impl RecentInvoices {
    fn new(capacity: usize) -> Self {
        Self {
            window: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// false if the invoice is already in the window
    fn insert(&mut self, invoice: &str) -> bool {
        let Some(window) = self.window.as_mut() else {
            return true;
        };
        if window.contains(invoice) {
            return false;
        }
        window.put(invoice.to_string(), ());
        true
    }

    fn remove(&mut self, invoice: &str) {
        if let Some(window) = self.window.as_mut() {
            window.pop(invoice);
        }
    }
}

/// The listener handed to the adapter
struct Intake {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    recent: Mutex<RecentInvoices>,
    counters: Arc<Counters>,
    on_overflow: Option<OverflowCallback>,
}

impl Intake {
    fn new(
        sender: mpsc::Sender<String>,
        dedupe_window: usize,
        counters: Arc<Counters>,
        on_overflow: Option<OverflowCallback>,
    ) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            recent: Mutex::new(RecentInvoices::new(dedupe_window)),
            counters,
            on_overflow,
        }
    }

    /// Stop accepting; workers exit once the queue is drained
    fn shut(&self) {
        self.sender.lock().take();
    }
}

impl SettlementListener for Intake {
    fn on_settled(&self, invoice: String) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            debug!(invoice = %invoice, "Runner closed, ignoring settlement push");
            return;
        };

        if !self.recent.lock().insert(&invoice) {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(invoice = %invoice, "Duplicate settlement push suppressed");
            return;
        }

        match tx.try_send(invoice) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(invoice)) => {
                self.recent.lock().remove(&invoice);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(invoice = %invoice, "Settlement queue full, event dropped");
                if let Some(callback) = &self.on_overflow {
                    callback(&invoice);
                }
            }
            Err(TrySendError::Closed(invoice)) => {
                debug!(invoice = %invoice, "Settlement queue closed, ignoring push");
            }
        }
    }

    fn on_error(&self, error: AdapterError) {
        warn!("Settlement subscription error: {}", error);
    }
}

pub struct SubscriptionRunner {
    intake: Arc<Intake>,
    counters: Arc<Counters>,
    subscription: Option<SubscriptionHandle>,
    workers: Vec<JoinHandle<()>>,
}

impl SubscriptionRunner {
    pub async fn start(
        adapter: Arc<dyn SettlementAdapter>,
        tips: Arc<dyn TipIntentStore>,
        ledger: Arc<Ledger>,
        clock: Clock,
        config: SubscriptionRunnerConfig,
        on_overflow: Option<OverflowCallback>,
    ) -> AppResult<Self> {
        let (tx, rx) = mpsc::channel::<String>(config.max_pending_events.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.concurrency.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    rx.clone(),
                    tips.clone(),
                    ledger.clone(),
                    clock.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        let intake = Arc::new(Intake::new(
            tx,
            config.dedupe_window,
            counters.clone(),
            on_overflow,
        ));

        let subscription = match adapter.subscribe_settlements(intake.clone()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                intake.shut();
                return Err(e.into());
            }
        };

        info!(
            adapter = adapter.name(),
            concurrency = config.concurrency,
            max_pending_events = config.max_pending_events,
            dedupe_window = config.dedupe_window,
            "Settlement subscription runner started"
        );

        Ok(Self {
            intake,
            counters,
            subscription: Some(subscription),
            workers,
        })
    }

    pub fn stats(&self) -> RunnerStats {
        self.counters.snapshot()
    }

    /// Stops intake, closes the upstream subscription, then waits for every
    /// queued and in-flight settlement.
    pub async fn close(mut self) -> RunnerStats {
        self.intake.shut();

        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Settlement worker panicked: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            credited = stats.credited,
            duplicates = stats.duplicates,
            dropped = stats.dropped,
            errors = stats.errors,
            "Settlement subscription runner closed"
        );
        stats
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    tips: Arc<dyn TipIntentStore>,
    ledger: Arc<Ledger>,
    clock: Clock,
    counters: Arc<Counters>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(invoice) = next else {
            break;
        };

        match settle_invoice(&ledger, tips.as_ref(), &invoice, clock()).await {
            Ok(applied) if applied.credit_applied => {
                counters.credited.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(invoice = %invoice, "Pushed settlement already credited");
            }
            Err(AppError::TipIntent(TipIntentError::NotFound { matches, .. })) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(invoice = %invoice, matches, "Pushed settlement has no unique tip intent");
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                error!(invoice = %invoice, worker_id, "Pushed settlement failed: {}", e);
            }
        }
    }

    debug!(worker_id, "Settlement worker drained");
}
