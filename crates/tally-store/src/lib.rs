//! Storage layer for the tally credit ledger.
//!
//! This crate persists balances, the append-only transaction log, and
//! top-up failure records. Two backends implement the [`Store`] trait:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`. Per-(user, key) mutation is
//!   serialized with a row-level `SELECT … FOR UPDATE`; idempotency keys are
//!   enforced by a partial unique index so a replayed write is rejected by
//!   the insert itself.
//! - [`MemoryStore`]: in-process `HashMap` backend for tests.
//!
//! All coordination happens in the shared database: the ledger is safe under
//! many concurrent server processes, and no balance is ever cached in memory.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{
    BalanceKey, BalanceRecord, CreditTransaction, DeclineType, LedgerWrite, PaymentMethodId,
    TopUpFailure, UserId,
};

/// The storage trait defining all ledger and failure-tracker operations.
///
/// All operations on a single (user, key) pair are linearizable: concurrent
/// [`Store::apply`] calls against the same pair serialize so balance-after
/// values form a gap-free chain. Pairs do not block each other.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Read the balance row for one (user, key) pair.
    ///
    /// Absent rows are `Ok(None)`: a never-written balance reads as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn balance(&self, user_id: &UserId, key: &BalanceKey)
        -> Result<Option<BalanceRecord>>;

    /// Read every balance row for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn balances(&self, user_id: &UserId) -> Result<Vec<BalanceRecord>>;

    // =========================================================================
    // Ledger Mutation
    // =========================================================================

    /// Execute one atomic ledger write: serialize on the (user, key) pair,
    /// compute the new balance, write it, and append the matching
    /// transaction — all in one atomic unit.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InsufficientBalance`] for a guarded subtract below zero.
    /// - [`StoreError::IdempotencyConflict`] for a replayed idempotency key;
    ///   no mutation occurs.
    /// - [`StoreError::CurrencyMismatch`] for a wallet write whose currency
    ///   differs from the pinned one.
    async fn apply(&self, write: &LedgerWrite) -> Result<CreditTransaction>;

    /// List transactions for one (user, key) pair, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn history(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>>;

    /// Count automatic top-up credits recorded since `since` for the pair.
    ///
    /// Feeds the calendar-month attempt cap; callers pass a UTC month start.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn count_auto_top_ups_since(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        since: DateTime<Utc>,
    ) -> Result<u32>;

    // =========================================================================
    // Top-Up Failure Tracking
    // =========================================================================

    /// Read the failure record for one (user, key) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn failure(&self, user_id: &UserId, key: &BalanceKey) -> Result<Option<TopUpFailure>>;

    /// Record a failed automatic top-up attempt: initialize the record at
    /// count 1 or increment the existing count, updating classification,
    /// decline code, payment method, and timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn record_failure(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        payment_method_id: Option<&PaymentMethodId>,
        decline_type: DeclineType,
        decline_code: Option<&str>,
    ) -> Result<TopUpFailure>;

    /// Delete the failure record for one (user, key) pair, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn clear_failures(&self, user_id: &UserId, key: &BalanceKey) -> Result<()>;

    /// Delete every failure record for a user (payment-method change).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn clear_all_failures(&self, user_id: &UserId) -> Result<()>;
}

/// Compute the balance delta a write produces against `current`, enforcing
/// the non-negative constraint for guarded subtracts.
///
/// Shared by both backends so the arithmetic cannot drift between them.
///
/// # Errors
///
/// Returns [`StoreError::InsufficientBalance`] when a guarded subtract would
/// take the balance below zero.
pub(crate) fn compute_delta(current: i64, mode: tally_core::WriteMode) -> Result<i64> {
    use tally_core::WriteMode;

    match mode {
        WriteMode::Add { amount } => Ok(amount),
        WriteMode::Subtract {
            amount,
            allow_negative,
        } => {
            if !allow_negative && current < amount {
                return Err(StoreError::InsufficientBalance {
                    balance: current,
                    required: amount,
                });
            }
            Ok(-amount)
        }
        WriteMode::Set { target } => Ok(target - current),
    }
}

/// Resolve the currency a write leaves on the balance row.
///
/// The first write carrying a currency pins it; later writes must match.
///
/// # Errors
///
/// Returns [`StoreError::CurrencyMismatch`] when the write's currency differs
/// from the pinned one.
pub(crate) fn resolve_currency(
    pinned: Option<&str>,
    requested: Option<&str>,
) -> Result<Option<String>> {
    match (pinned, requested) {
        (Some(p), Some(r)) if p != r => Err(StoreError::CurrencyMismatch {
            pinned: p.to_string(),
            requested: r.to_string(),
        }),
        (Some(p), _) => Ok(Some(p.to_string())),
        (None, r) => Ok(r.map(String::from)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::WriteMode;

    #[test]
    fn guarded_subtract_rejects_overdraft() {
        let err = compute_delta(
            40,
            WriteMode::Subtract {
                amount: 41,
                allow_negative: false,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientBalance {
                balance: 40,
                required: 41
            }
        ));
    }

    #[test]
    fn unguarded_subtract_goes_negative() {
        let delta = compute_delta(
            300,
            WriteMode::Subtract {
                amount: 500,
                allow_negative: true,
            },
        )
        .unwrap();
        assert_eq!(delta, -500);
    }

    #[test]
    fn set_records_delta_from_prior_balance() {
        assert_eq!(compute_delta(-200, WriteMode::Set { target: 500 }).unwrap(), 700);
        assert_eq!(compute_delta(100, WriteMode::Set { target: 0 }).unwrap(), -100);
    }

    #[test]
    fn currency_pins_on_first_write() {
        assert_eq!(resolve_currency(None, Some("usd")).unwrap(), Some("usd".into()));
        assert_eq!(resolve_currency(Some("usd"), None).unwrap(), Some("usd".into()));
        assert_eq!(
            resolve_currency(Some("usd"), Some("usd")).unwrap(),
            Some("usd".into())
        );
    }

    #[test]
    fn currency_change_is_rejected() {
        let err = resolve_currency(Some("usd"), Some("eur")).unwrap_err();
        assert!(matches!(err, StoreError::CurrencyMismatch { .. }));
    }
}
