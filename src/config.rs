use config::Source as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Rpc,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStrategy {
    /// Polling only
    Polling,
    /// Push runner on top of polling
    Subscription,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    pub adapter: AdapterKind,
    pub rpc_url: Option<String>,
    pub stream_url: Option<String>,
    pub rpc_timeout: Duration,

    pub tick_interval: Duration,
    pub withdrawal_interval: Duration,
    pub withdrawal_batch_size: usize,
    pub withdrawal_max_retries: u32,
    pub withdrawal_retry_delay: Duration,

    pub settlement_interval: Duration,
    pub settlement_batch_size: usize,
    pub settlement_max_retries: u32,
    pub settlement_retry_delay: Duration,
    pub settlement_pending_timeout: Duration,
    pub settlement_app_id: Option<String>,
    pub settlement_strategy: SettlementStrategy,

    pub subscription_concurrency: usize,
    pub subscription_max_pending_events: usize,
    pub subscription_dedupe_window: usize,

    pub cursor_path: PathBuf,
    pub shutdown_timeout: Duration,
}

/// Raw key/value view over the environment
struct EnvValues {
    values: HashMap<String, String>,
}

impl EnvValues {
    fn load(overrides: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().source(overrides))
            .build()?;

        let values = settings
            .collect()?
            .into_iter()
            .filter_map(|(key, value)| {
                let value = value.into_string().ok()?;
                Some((key.to_ascii_uppercase(), value))
            })
            .collect();

        Ok(Self { values })
    }

    fn string(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.string(key).ok_or(ConfigError::Missing { key })
    }

    fn integer(&self, key: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };

        let value: u64 = raw.parse().map_err(|_| ConfigError::InvalidInteger {
            key,
            value: raw.clone(),
        })?;

        if value < min || value > max {
            return Err(ConfigError::OutOfRange { key, value, min, max });
        }
        Ok(value)
    }

    fn millis(&self, key: &'static str, default: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
        self.integer(key, default, min, max).map(Duration::from_millis)
    }

    fn variant<T: Copy>(
        &self,
        key: &'static str,
        default: T,
        expected: &'static [&'static str],
        choices: &[T],
    ) -> Result<T, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };

        let lowered = raw.to_ascii_lowercase();
        expected
            .iter()
            .position(|name| *name == lowered)
            .map(|index| choices[index])
            .ok_or(ConfigError::UnknownVariant {
                key,
                value: raw,
                expected,
            })
    }
}

impl WorkerConfig {
    /// Reads `.env` (if present) and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_source(None)
    }

    /// `Some(map)` replaces the process environment, for tests
    pub fn from_source(overrides: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let src = EnvValues::load(overrides)?;

        let storage_backend = src.variant(
            "STORAGE_BACKEND",
            StorageBackend::Postgres,
            &["postgres", "memory"],
            &[StorageBackend::Postgres, StorageBackend::Memory],
        )?;
        let database_url = match storage_backend {
            StorageBackend::Postgres => Some(src.required("DATABASE_URL")?),
            StorageBackend::Memory => src.string("DATABASE_URL"),
        };

        let adapter = src.variant(
            "SETTLEMENT_ADAPTER",
            AdapterKind::Rpc,
            &["rpc", "mock"],
            &[AdapterKind::Rpc, AdapterKind::Mock],
        )?;
        let settlement_strategy = src.variant(
            "SETTLEMENT_STRATEGY",
            SettlementStrategy::Polling,
            &["polling", "subscription"],
            &[SettlementStrategy::Polling, SettlementStrategy::Subscription],
        )?;

        let rpc_url = match adapter {
            AdapterKind::Rpc => Some(src.required("SETTLEMENT_RPC_URL")?),
            AdapterKind::Mock => src.string("SETTLEMENT_RPC_URL"),
        };
        let stream_url = match (adapter, settlement_strategy) {
            (AdapterKind::Rpc, SettlementStrategy::Subscription) => {
                Some(src.required("SETTLEMENT_STREAM_URL")?)
            }
            _ => src.string("SETTLEMENT_STREAM_URL"),
        };

        Ok(Self {
            storage_backend,
            database_url,
            database_max_connections: src.integer("DATABASE_MAX_CONNECTIONS", 10, 1, 500)? as u32,

            adapter,
            rpc_url,
            stream_url,
            rpc_timeout: src.millis("SETTLEMENT_RPC_TIMEOUT_MS", 10_000, 100, 300_000)?,

            tick_interval: src.millis("WORKER_TICK_INTERVAL_MS", 1_000, 10, 3_600_000)?,
            withdrawal_interval: src.millis("WITHDRAWAL_INTERVAL_MS", 5_000, 100, 86_400_000)?,
            withdrawal_batch_size: src.integer("WITHDRAWAL_BATCH_SIZE", 25, 1, 1_000)? as usize,
            withdrawal_max_retries: src.integer("WITHDRAWAL_MAX_RETRIES", 5, 1, 100)? as u32,
            withdrawal_retry_delay: src.millis("WITHDRAWAL_RETRY_DELAY_MS", 30_000, 0, 86_400_000)?,

            settlement_interval: src.millis("SETTLEMENT_INTERVAL_MS", 10_000, 100, 86_400_000)?,
            settlement_batch_size: src.integer("SETTLEMENT_BATCH_SIZE", 100, 1, 10_000)? as usize,
            settlement_max_retries: src.integer("SETTLEMENT_MAX_RETRIES", 5, 0, 100)? as u32,
            settlement_retry_delay: src.millis("SETTLEMENT_RETRY_DELAY_MS", 60_000, 0, 86_400_000)?,
            settlement_pending_timeout: src.millis(
                "SETTLEMENT_PENDING_TIMEOUT_MS",
                86_400_000,
                1_000,
                2_592_000_000,
            )?,
            settlement_app_id: src.string("SETTLEMENT_APP_ID"),
            settlement_strategy,

            subscription_concurrency: src.integer("SUBSCRIPTION_CONCURRENCY", 1, 1, 64)? as usize,
            subscription_max_pending_events: src
                .integer("SUBSCRIPTION_MAX_PENDING_EVENTS", 1_000, 1, 100_000)?
                as usize,
            subscription_dedupe_window: src.integer("SUBSCRIPTION_DEDUPE_WINDOW", 1_024, 0, 100_000)?
                as usize,

            cursor_path: src
                .string("SETTLEMENT_CURSOR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/settlement-cursor.json")),
            shutdown_timeout: src.millis("SHUTDOWN_TIMEOUT_MS", 30_000, 0, 600_000)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_for_memory_and_mock() {
        let cfg = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("SETTLEMENT_ADAPTER", "mock"),
        ]))
        .unwrap();

        assert_eq!(cfg.storage_backend, StorageBackend::Memory);
        assert_eq!(cfg.adapter, AdapterKind::Mock);
        assert_eq!(cfg.settlement_strategy, SettlementStrategy::Polling);
        assert_eq!(cfg.tick_interval, Duration::from_millis(1_000));
        assert_eq!(cfg.withdrawal_batch_size, 25);
        assert_eq!(cfg.settlement_max_retries, 5);
        assert_eq!(cfg.settlement_pending_timeout, Duration::from_millis(86_400_000));
        assert_eq!(cfg.subscription_concurrency, 1);
        assert_eq!(cfg.subscription_dedupe_window, 1_024);
        assert_eq!(cfg.cursor_path, PathBuf::from("./data/settlement-cursor.json"));
        assert_eq!(cfg.shutdown_timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.settlement_app_id, None);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let err = WorkerConfig::from_source(env(&[("SETTLEMENT_ADAPTER", "mock")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "DATABASE_URL" }));
    }

    #[test]
    fn test_subscription_over_rpc_requires_stream_url() {
        let err = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("SETTLEMENT_RPC_URL", "http://localhost:9000"),
            ("SETTLEMENT_STRATEGY", "subscription"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "SETTLEMENT_STREAM_URL" }));
    }

    #[test]
    fn test_invalid_integer_is_named() {
        let err = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("SETTLEMENT_ADAPTER", "mock"),
            ("WITHDRAWAL_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "WITHDRAWAL_BATCH_SIZE must be an integer, got \"lots\""
        );
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let err = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("SETTLEMENT_ADAPTER", "mock"),
            ("SUBSCRIPTION_CONCURRENCY", "65"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                key: "SUBSCRIPTION_CONCURRENCY",
                value: 65,
                min: 1,
                max: 64
            }
        ));
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("SETTLEMENT_ADAPTER", "mock"),
            ("SETTLEMENT_STRATEGY", "webhook"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownVariant { key: "SETTLEMENT_STRATEGY", .. }
        ));
    }

    #[test]
    fn test_overrides_are_applied() {
        let cfg = WorkerConfig::from_source(env(&[
            ("STORAGE_BACKEND", "Postgres"),
            ("DATABASE_URL", "postgres://localhost/tips"),
            ("SETTLEMENT_RPC_URL", "http://localhost:9000"),
            ("SETTLEMENT_STREAM_URL", "http://localhost:9000/stream"),
            ("SETTLEMENT_STRATEGY", "subscription"),
            ("SETTLEMENT_MAX_RETRIES", "0"),
            ("SETTLEMENT_APP_ID", "app-1"),
            ("SUBSCRIPTION_DEDUPE_WINDOW", "0"),
            ("SETTLEMENT_CURSOR_PATH", "/tmp/cursor.json"),
        ]))
        .unwrap();

        assert_eq!(cfg.storage_backend, StorageBackend::Postgres);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/tips"));
        assert_eq!(cfg.adapter, AdapterKind::Rpc);
        assert_eq!(cfg.settlement_strategy, SettlementStrategy::Subscription);
        assert_eq!(cfg.settlement_max_retries, 0);
        assert_eq!(cfg.settlement_app_id.as_deref(), Some("app-1"));
        assert_eq!(cfg.subscription_dedupe_window, 0);
        assert_eq!(cfg.cursor_path, PathBuf::from("/tmp/cursor.json"));
    }
}
