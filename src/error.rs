//! Error types for the settlement engine

use thiserror::Error;

/// Main error type for the settlement engine
#[derive(Error, Debug)]
pub enum SettlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Order book error: {0}")]
    Orderbook(String),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Swap record already exists for ({account}, {secret_hash})")]
    DuplicateKey { account: String, secret_hash: String },

    #[error("No swap record for ({account}, {secret_hash})")]
    NotFound { account: String, secret_hash: String },

    #[error("Illegal swap state transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Swap state {state} is not retryable")]
    NotRetryable { state: String },

    #[error("Batch queue is full ({capacity} pending actions)")]
    QueueFull { capacity: usize },

    #[error("Malformed order {order_id}: {message}")]
    MalformedOrder { order_id: u64, message: String },

    #[error("Secret not found for swap {swap_id}")]
    SecretNotFound { swap_id: String },

    #[error("Insufficient funds on {chain}: have {have}, need {need}")]
    InsufficientFunds {
        chain: String,
        have: String,
        need: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlerError {
    /// Transient errors are logged and retried on the next order observation;
    /// they never persist a FailedTo* status.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlerError::ChainConnection { .. }
                | SettlerError::Timeout { .. }
                | SettlerError::Orderbook(_)
        )
    }

    /// Check if error should trigger an operator alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SettlerError::InsufficientFunds { .. }
                | SettlerError::Wallet(_)
                | SettlerError::QueueFull { .. }
        )
    }
}

/// Result type for settlement operations
pub type SettlerResult<T> = Result<T, SettlerError>;
