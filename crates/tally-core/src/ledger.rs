//! Ledger transaction types.
//!
//! Every balance mutation appends exactly one transaction record in the same
//! atomic unit as the balance write. The append-only log is the audit trail:
//! for a given (user, key), each transaction's `balance_after` must equal the
//! previous transaction's `balance_after` plus its own `amount`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{BalanceKey, TransactionId, UserId};

/// An append-only ledger record describing one balance change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// The balance key that was mutated.
    pub key: BalanceKey,

    /// Signed amount in the key's unit. Positive = credit, negative = debit.
    pub amount: i64,

    /// Balance after this transaction.
    pub balance_after: i64,

    /// What kind of change this was.
    pub transaction_type: TransactionType,

    /// What triggered the change.
    pub source: TransactionSource,

    /// Optional reference to the triggering object (payment intent, invoice,
    /// subscription id).
    pub source_id: Option<String>,

    /// Optional caller-supplied idempotency key. At most one transaction per
    /// (user, key, idempotency key) can ever exist.
    pub idempotency_key: Option<String>,

    /// Human-readable description.
    pub description: Option<String>,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Balance was increased.
    Grant,

    /// Balance was decreased by usage.
    Consume,

    /// Balance was removed (cancellation, free-plan upgrade, seat removal).
    Revoke,

    /// Balance was overwritten; the amount records the delta from the prior
    /// balance.
    Adjust,
}

impl TransactionType {
    /// Stable string form used by the persistence layer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Consume => "consume",
            Self::Revoke => "revoke",
            Self::Adjust => "adjust",
        }
    }
}

impl FromStr for TransactionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self::Grant),
            "consume" => Ok(Self::Consume),
            "revoke" => Ok(Self::Revoke),
            "adjust" => Ok(Self::Adjust),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    /// Initial grant when a subscription starts.
    Subscription,

    /// Billing-cycle renewal.
    Renewal,

    /// Operator or application action.
    Manual,

    /// User-initiated top-up purchase.
    TopUp,

    /// Automatic below-threshold top-up.
    AutoTopUp,

    /// Metered usage deduction.
    Usage,

    /// Subscription cancellation revoke.
    Cancellation,

    /// Seat removal revoke.
    SeatRevoke,

    /// Plan upgrade/downgrade adjustment.
    PlanChange,
}

impl TransactionSource {
    /// Stable string form used by the persistence layer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Renewal => "renewal",
            Self::Manual => "manual",
            Self::TopUp => "topup",
            Self::AutoTopUp => "auto_topup",
            Self::Usage => "usage",
            Self::Cancellation => "cancellation",
            Self::SeatRevoke => "seat_revoke",
            Self::PlanChange => "plan_change",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "renewal" => Ok(Self::Renewal),
            "manual" => Ok(Self::Manual),
            "topup" => Ok(Self::TopUp),
            "auto_topup" => Ok(Self::AutoTopUp),
            "usage" => Ok(Self::Usage),
            "cancellation" => Ok(Self::Cancellation),
            "seat_revoke" => Ok(Self::SeatRevoke),
            "plan_change" => Ok(Self::PlanChange),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored enum value the current build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(
    /// The unrecognized value.
    pub String,
);

/// How a [`LedgerWrite`] mutates the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Increase the balance by `amount` (> 0).
    Add {
        /// Units to add.
        amount: i64,
    },

    /// Decrease the balance by `amount` (> 0). When `allow_negative` is
    /// false the write fails rather than taking the balance below zero.
    Subtract {
        /// Units to subtract.
        amount: i64,
        /// Whether the balance may go negative (wallet semantics).
        allow_negative: bool,
    },

    /// Overwrite the balance with `target`; the recorded amount is the delta.
    Set {
        /// New balance value.
        target: i64,
    },
}

/// A single atomic ledger mutation, executed by the store.
///
/// The store serializes writes per (user, key), computes the resulting
/// balance, and appends the matching [`CreditTransaction`] in one atomic
/// unit. Idempotency keys are enforced by the store's native uniqueness
/// constraint, not by a separate existence check.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    /// The user whose balance is mutated.
    pub user_id: UserId,

    /// The balance key to mutate.
    pub key: BalanceKey,

    /// The mutation to apply.
    pub mode: WriteMode,

    /// Transaction type recorded in the log.
    pub transaction_type: TransactionType,

    /// Transaction source recorded in the log.
    pub source: TransactionSource,

    /// Optional reference to the triggering object.
    pub source_id: Option<String>,

    /// Optional idempotency key; a replay fails with an idempotency conflict
    /// and performs no mutation.
    pub idempotency_key: Option<String>,

    /// Optional human-readable description.
    pub description: Option<String>,

    /// Wallet currency to pin or verify. Must be `None` for credit keys.
    pub currency: Option<String>,
}

/// Verify the balance-after chain for one (user, key) slice of the log.
///
/// `transactions` must be ordered oldest first. Returns the first index whose
/// recorded `balance_after` does not chain from its predecessor, or `None`
/// when the slice is consistent.
#[must_use]
pub fn verify_chain(transactions: &[CreditTransaction]) -> Option<usize> {
    let mut running = 0i64;
    for (i, tx) in transactions.iter().enumerate() {
        running += tx.amount;
        if tx.balance_after != running {
            return Some(i);
        }
    }
    None
}
