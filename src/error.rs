use serde::{Deserialize, Serialize};
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::withdrawals::models::WithdrawalState;

/// Top-level error type for the settlement worker
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] MigrateError),

    #[error("Amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("Tip intent error: {0}")]
    TipIntent(#[from] TipIntentError),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("Settlement adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Decimal parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("Amount must be strictly positive, got {0}")]
    NotPositive(String),
}

/// Tip intent store errors
#[derive(Error, Debug)]
pub enum TipIntentError {
    #[error("Invoice already has a tip intent: {0}")]
    DuplicateInvoice(String),

    /// Zero matches is a miss; more than one is an integrity violation.
    #[error("Tip intent not found for invoice {invoice} ({matches} matches)")]
    NotFound { invoice: String, matches: usize },

    #[error("Tip intent not found: {0}")]
    NotFoundById(Uuid),
}

/// Withdrawal state machine errors
#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Withdrawal not found: {0}")]
    NotFound(Uuid),

    #[error("Withdrawal {id} transition conflict: state is {actual:?}, expected one of {expected:?}")]
    TransitionConflict {
        id: Uuid,
        expected: Vec<WithdrawalState>,
        actual: WithdrawalState,
    },
}

/// How a failed call to the payment network should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Terminal,
}

/// Errors returned by a settlement adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl AdapterError {
    /// Client-class protocol errors are terminal, everything else is retried.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            // JSON-RPC parse error, invalid request, method not found, invalid params
            AdapterError::Rpc { code, .. } if matches!(*code, -32700 | -32600 | -32601 | -32602) => {
                FailureClass::Terminal
            }
            AdapterError::Http { status, .. }
                if (400..500).contains(status) && *status != 408 && *status != 429 =>
            {
                FailureClass::Terminal
            }
            _ => FailureClass::Transient,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AdapterError::Timeout
        } else if let Some(status) = error.status() {
            AdapterError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else if error.is_decode() {
            AdapterError::InvalidResponse(error.to_string())
        } else {
            AdapterError::Transport(error.to_string())
        }
    }
}

/// Startup configuration errors, each naming the offending key
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("{key} must be an integer, got {value:?}")]
    InvalidInteger { key: &'static str, value: String },

    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{key} has unknown value {value:?}, expected one of {expected:?}")]
    UnknownVariant {
        key: &'static str,
        value: String,
        expected: &'static [&'static str],
    },

    #[error("Failed to read configuration source: {0}")]
    Source(#[from] config::ConfigError),
}

/// Result type alias for the worker
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_client_errors_are_terminal() {
        for code in [-32700, -32600, -32601, -32602] {
            let err = AdapterError::Rpc { code, message: "bad".into() };
            assert_eq!(err.failure_class(), FailureClass::Terminal);
        }

        let internal = AdapterError::Rpc { code: -32603, message: "internal".into() };
        assert_eq!(internal.failure_class(), FailureClass::Transient);

        let server = AdapterError::Rpc { code: -32000, message: "busy".into() };
        assert_eq!(server.failure_class(), FailureClass::Transient);
    }

    #[test]
    fn test_http_classification() {
        let bad_request = AdapterError::Http { status: 400, message: String::new() };
        assert_eq!(bad_request.failure_class(), FailureClass::Terminal);

        let throttled = AdapterError::Http { status: 429, message: String::new() };
        assert_eq!(throttled.failure_class(), FailureClass::Transient);

        let unavailable = AdapterError::Http { status: 503, message: String::new() };
        assert_eq!(unavailable.failure_class(), FailureClass::Transient);

        assert_eq!(AdapterError::Timeout.failure_class(), FailureClass::Transient);
        assert_eq!(
            AdapterError::Transport("reset".into()).failure_class(),
            FailureClass::Transient
        );
    }
}
