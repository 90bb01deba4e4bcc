use chrono::Duration as ChronoDuration;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::{MockSettlementAdapter, RpcAdapterConfig, RpcSettlementAdapter, SettlementAdapter};
use crate::config::{AdapterKind, SettlementStrategy, StorageBackend, WorkerConfig};
use crate::error::{AppResult, ConfigError};
use crate::ledger::memory::InMemoryLedgerStore;
use crate::ledger::repository::{LedgerStore, PgLedgerRepository};
use crate::ledger::Ledger;
use crate::settlement::{
    system_clock, Clock, CursorStore, ScanOptions, SettlementDiscovery, SubscriptionRunnerConfig,
    WorkerRuntime, WorkerSchedule,
};
use crate::tips::{InMemoryTipIntentStore, PgTipIntentRepository, TipIntentStore};
use crate::withdrawals::{
    AdapterWithdrawalExecutor, InMemoryWithdrawalStore, PgWithdrawalRepository, ProcessorConfig,
    WithdrawalProcessor, WithdrawalStore,
};

const STREAM_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct Stores {
    ledger: Arc<dyn LedgerStore>,
    tips: Arc<dyn TipIntentStore>,
    withdrawals: Arc<dyn WithdrawalStore>,
}

/// Everything `main` needs, constructed once and shared by `Arc`
pub struct Worker {
    pub adapter: Arc<dyn SettlementAdapter>,
    pub tips: Arc<dyn TipIntentStore>,
    pub ledger: Arc<Ledger>,
    pub clock: Clock,
    pub runtime: WorkerRuntime,
    /// Set when the push runner should start alongside polling
    pub subscription: Option<SubscriptionRunnerConfig>,
}

pub async fn initialize_worker(config: &WorkerConfig) -> AppResult<Worker> {
    info!("Initializing settlement worker components...");

    let stores = initialize_stores(config).await?;
    let adapter = initialize_adapter(config)?;
    let clock = system_clock();

    let ledger = Arc::new(Ledger::new(stores.ledger));

    let processor = Arc::new(WithdrawalProcessor::new(
        stores.withdrawals,
        Arc::new(AdapterWithdrawalExecutor::new(adapter.clone())),
        ProcessorConfig {
            batch_size: config.withdrawal_batch_size,
            max_retries: config.withdrawal_max_retries,
            retry_delay: chrono_millis(config.withdrawal_retry_delay),
        },
    ));

    let discovery = Arc::new(SettlementDiscovery::new(
        adapter.clone(),
        stores.tips.clone(),
        ledger.clone(),
        clock.clone(),
    ));

    let scan = ScanOptions {
        limit: config.settlement_batch_size,
        app_id: config.settlement_app_id.clone(),
        created_from: None,
        created_to: None,
        cursor: None,
        max_retries: config.settlement_max_retries,
        retry_delay: chrono_millis(config.settlement_retry_delay),
        pending_timeout: chrono_millis(config.settlement_pending_timeout),
    };

    let schedule = WorkerSchedule {
        tick_interval: config.tick_interval,
        withdrawal_interval: chrono_millis(config.withdrawal_interval),
        settlement_interval: chrono_millis(config.settlement_interval),
        shutdown_timeout: config.shutdown_timeout,
    };

    let runtime = WorkerRuntime::new(
        processor,
        discovery,
        ledger.clone(),
        CursorStore::new(config.cursor_path.clone()),
        scan,
        clock.clone(),
        schedule,
    );

    let subscription = match config.settlement_strategy {
        SettlementStrategy::Polling => None,
        SettlementStrategy::Subscription => Some(SubscriptionRunnerConfig {
            concurrency: config.subscription_concurrency,
            max_pending_events: config.subscription_max_pending_events,
            dedupe_window: config.subscription_dedupe_window,
        }),
    };

    info!(
        storage = ?config.storage_backend,
        adapter = adapter.name(),
        strategy = ?config.settlement_strategy,
        "Settlement worker initialized"
    );

    Ok(Worker {
        adapter,
        tips: stores.tips,
        ledger,
        clock,
        runtime,
        subscription,
    })
}

async fn initialize_stores(config: &WorkerConfig) -> AppResult<Stores> {
    match config.storage_backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all state is lost on exit");
            Ok(Stores {
                ledger: Arc::new(InMemoryLedgerStore::new()),
                tips: Arc::new(InMemoryTipIntentStore::new()),
                withdrawals: Arc::new(InMemoryWithdrawalStore::new()),
            })
        }
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing { key: "DATABASE_URL" })?;
            let pool = initialize_database(url, config.database_max_connections).await?;
            Ok(Stores {
                ledger: Arc::new(PgLedgerRepository::new(pool.clone())),
                tips: Arc::new(PgTipIntentRepository::new(pool.clone())),
                withdrawals: Arc::new(PgWithdrawalRepository::new(pool)),
            })
        }
    }
}

fn initialize_adapter(config: &WorkerConfig) -> AppResult<Arc<dyn SettlementAdapter>> {
    match config.adapter {
        AdapterKind::Mock => {
            warn!("Using the mock settlement adapter");
            Ok(Arc::new(MockSettlementAdapter::new()))
        }
        AdapterKind::Rpc => {
            let rpc_url = config
                .rpc_url
                .clone()
                .ok_or(ConfigError::Missing { key: "SETTLEMENT_RPC_URL" })?;
            info!(rpc_url = %rpc_url, "Settlement RPC adapter configured");
            Ok(Arc::new(RpcSettlementAdapter::new(RpcAdapterConfig {
                rpc_url,
                stream_url: config.stream_url.clone(),
                timeout: config.rpc_timeout,
                reconnect_backoff: STREAM_RECONNECT_BACKOFF,
            })))
        }
    }
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!(max_connections, "Database pool configured");

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}

fn chrono_millis(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
