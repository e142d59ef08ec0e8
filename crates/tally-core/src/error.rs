//! Error types for the tally ledger.

use crate::ids::IdError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger, top-up, and lifecycle operations.
///
/// Expected, branch-on outcomes (a `consume` hitting an empty credit balance)
/// are modeled as typed result values by the callers, not as this error; the
/// variants here are genuine failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Amount was zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Credit balance would go negative.
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

    /// A wallet write tried to change the pinned currency.
    #[error("currency mismatch: wallet is {pinned}, write requested {requested}")]
    CurrencyMismatch {
        /// The currency pinned by the first wallet write.
        pinned: String,
        /// The currency the rejected write carried.
        requested: String,
    },

    /// The customer has no usable payment method on file.
    #[error("no payment method on file")]
    NoPaymentMethod,

    /// A charge attempt was declined.
    #[error("payment failed{}", .decline_code.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    PaymentFailed {
        /// Raw decline code, if the network sent one.
        decline_code: Option<String>,
    },

    /// The customer has no subscription the operation requires.
    #[error("no subscription")]
    NoSubscription,

    /// Wallet operations were invoked without wallet configuration.
    #[error("wallet not configured")]
    WalletNotConfigured,

    /// No customer profile could be resolved for the user.
    #[error("user not found: {user_id}")]
    UserNotFound {
        /// The unresolvable user.
        user_id: String,
    },

    /// A usage-billed balance key has no tracking configuration.
    #[error("usage tracking not enabled for key: {key}")]
    TrackingNotEnabled {
        /// The misconfigured key.
        key: String,
    },

    /// Upstream payment-provider failure not otherwise classified.
    #[error("payment provider error: {0}")]
    Gateway(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
