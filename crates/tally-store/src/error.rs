//! Storage error types.

use tally_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A guarded subtract would take a credit balance below zero.
    #[error("insufficient balance: balance={balance}, required={required}")]
    InsufficientBalance {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The idempotency key was already used for this (user, key) pair.
    #[error("idempotency conflict: {key}")]
    IdempotencyConflict {
        /// The replayed key.
        key: String,
    },

    /// A wallet write carried a currency different from the pinned one.
    #[error("currency mismatch: pinned={pinned}, requested={requested}")]
    CurrencyMismatch {
        /// Currency pinned by the first wallet write.
        pinned: String,
        /// Currency the rejected write carried.
        requested: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientBalance { balance, required } => {
                Self::InsufficientBalance { balance, required }
            }
            StoreError::IdempotencyConflict { key } => Self::IdempotencyConflict { key },
            StoreError::CurrencyMismatch { pinned, requested } => {
                Self::CurrencyMismatch { pinned, requested }
            }
            StoreError::Database(msg) | StoreError::Corrupt(msg) => Self::Storage(msg),
        }
    }
}
