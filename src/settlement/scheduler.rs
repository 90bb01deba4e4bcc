// Worker runtime - one ticker driving withdrawal batches and settlement polling
//
// Each sub-task keeps its own last-run timestamp and only runs once its
// interval has elapsed. At most one cycle is in flight: a tick that finds
// the previous cycle still running is skipped. Ledger debits are swept from
// COMPLETED withdrawals, so a debit that fails is picked up by a later cycle.
//
// Shutdown stops the ticker at once, then gives the in-flight cycle
// `shutdown_timeout` to finish. Every downstream write is idempotent, so
// abandoning a cycle on timeout is safe; the exit code reports it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::cursor::CursorStore;
use super::discovery::{ScanOptions, SettlementDiscovery};
use super::models::ScanSummary;
use super::Clock;
use crate::error::AppResult;
use crate::ledger::Ledger;
use crate::withdrawals::{BatchSummary, DebitSweep, WithdrawalProcessor};

#[derive(Debug, Clone)]
pub struct WorkerSchedule {
    pub tick_interval: Duration,
    pub withdrawal_interval: ChronoDuration,
    pub settlement_interval: ChronoDuration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The in-flight cycle finished in time
    Drained,
    /// Gave up waiting; work may be incomplete
    TimedOut,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Drained => 0,
            ShutdownOutcome::TimedOut => 1,
        }
    }
}

/// What one cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub withdrawals: Option<BatchSummary>,
    pub debits: Option<DebitSweep>,
    pub settlement: Option<ScanSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub cycles_started: u64,
    pub ticks_skipped: u64,
}

#[derive(Default)]
struct LastRuns {
    withdrawals: Option<DateTime<Utc>>,
    settlement: Option<DateTime<Utc>>,
}

fn is_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, every: ChronoDuration) -> bool {
    last.map_or(true, |at| now - at >= every)
}

struct CycleContext {
    processor: Arc<WithdrawalProcessor>,
    discovery: Arc<SettlementDiscovery>,
    ledger: Arc<Ledger>,
    cursor: CursorStore,
    scan: ScanOptions,
    clock: Clock,
    schedule: WorkerSchedule,
    last_runs: Mutex<LastRuns>,
}

impl CycleContext {
    async fn run_cycle(&self) -> CycleReport {
        let now = (self.clock)();
        let (withdrawals_due, settlement_due) = {
            let mut last = self.last_runs.lock().await;
            let withdrawals_due = is_due(last.withdrawals, now, self.schedule.withdrawal_interval);
            let settlement_due = is_due(last.settlement, now, self.schedule.settlement_interval);
            if withdrawals_due {
                last.withdrawals = Some(now);
            }
            if settlement_due {
                last.settlement = Some(now);
            }
            (withdrawals_due, settlement_due)
        };

        let mut report = CycleReport::default();

        if withdrawals_due {
            match self.processor.process_batch(now).await {
                Ok(summary) => report.withdrawals = Some(summary),
                Err(e) => error!("Withdrawal batch failed: {}", e),
            }
            match self.processor.apply_debits(&self.ledger, now).await {
                Ok(sweep) => report.debits = Some(sweep),
                Err(e) => error!("Withdrawal debit sweep failed: {}", e),
            }
        }

        if settlement_due {
            match self.run_settlement(now).await {
                Ok(summary) => report.settlement = Some(summary),
                Err(e) => error!("Settlement scan failed: {}", e),
            }
        }

        report
    }

    async fn run_settlement(&self, now: DateTime<Utc>) -> AppResult<ScanSummary> {
        let mut options = self.scan.clone();
        options.cursor = self.cursor.load().await?;

        let result = self.discovery.scan(&options).await?;

        match &result.summary.next_cursor {
            Some(next) => self.cursor.save(next, now).await?,
            None => self.cursor.clear().await?,
        }

        Ok(result.summary)
    }
}

pub struct WorkerRuntime {
    context: Arc<CycleContext>,
    cycles_started: AtomicU64,
    ticks_skipped: AtomicU64,
}

impl WorkerRuntime {
    pub fn new(
        processor: Arc<WithdrawalProcessor>,
        discovery: Arc<SettlementDiscovery>,
        ledger: Arc<Ledger>,
        cursor: CursorStore,
        scan: ScanOptions,
        clock: Clock,
        schedule: WorkerSchedule,
    ) -> Self {
        Self {
            context: Arc::new(CycleContext {
                processor,
                discovery,
                ledger,
                cursor,
                scan,
                clock,
                schedule,
                last_runs: Mutex::new(LastRuns::default()),
            }),
            cycles_started: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
        }
    }

    /// Runs one cycle inline, honouring the per-task intervals
    pub async fn run_cycle(&self) -> CycleReport {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
        self.context.run_cycle().await
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
        }
    }

    /// Ticks until `shutdown` flips to true (or its sender is dropped),
    /// then drains the in-flight cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ShutdownOutcome {
        let schedule = &self.context.schedule;
        let mut ticker = interval(schedule.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<CycleReport>> = None;

        info!(
            tick_ms = schedule.tick_interval.as_millis() as u64,
            withdrawal_interval_ms = schedule.withdrawal_interval.num_milliseconds(),
            settlement_interval_ms = schedule.settlement_interval.num_milliseconds(),
            "Worker runtime started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(handle) = in_flight.take() {
                        if !handle.is_finished() {
                            self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                            debug!("Previous cycle still running, skipping tick");
                            in_flight = Some(handle);
                            continue;
                        }
                        if let Err(e) = handle.await {
                            error!("Worker cycle panicked: {}", e);
                        }
                    }

                    self.cycles_started.fetch_add(1, Ordering::Relaxed);
                    let context = self.context.clone();
                    in_flight = Some(tokio::spawn(async move { context.run_cycle().await }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Worker runtime stopping, draining in-flight cycle");
        let Some(handle) = in_flight else {
            return ShutdownOutcome::Drained;
        };

        match tokio::time::timeout(schedule.shutdown_timeout, handle).await {
            Ok(Ok(_)) => ShutdownOutcome::Drained,
            Ok(Err(e)) => {
                error!("Worker cycle panicked during shutdown: {}", e);
                ShutdownOutcome::Drained
            }
            Err(_) => {
                warn!(
                    timeout_ms = schedule.shutdown_timeout.as_millis() as u64,
                    "In-flight cycle did not finish before the shutdown timeout"
                );
                ShutdownOutcome::TimedOut
            }
        }
    }
}
