//! Atomic balance operations.
//!
//! `LedgerService` is the only writer of balances and transactions. It
//! validates amounts, builds the atomic [`LedgerWrite`] the store executes,
//! and fires notifications. Reads always go to the store; balances are never
//! cached in process.

use std::sync::Arc;

use tally_core::{
    BalanceKey, BalanceRecord, CreditTransaction, LedgerError, LedgerWrite, Result,
    TransactionSource, TransactionType, UserId, WriteMode,
};
use tally_store::{Store, StoreError};

use crate::config::BillingConfig;
use crate::events::{BalanceLow, CreditsGranted, CreditsRevoked, EventSink};

/// Metadata attached to a single ledger operation.
#[derive(Debug, Clone)]
pub struct OperationMeta {
    /// What triggered the operation.
    pub source: TransactionSource,

    /// Optional reference to the triggering object.
    pub source_id: Option<String>,

    /// Optional idempotency key; replays are rejected without mutation.
    pub idempotency_key: Option<String>,

    /// Optional human-readable description.
    pub description: Option<String>,
}

impl OperationMeta {
    /// Metadata with only a source set.
    #[must_use]
    pub fn from_source(source: TransactionSource) -> Self {
        Self {
            source,
            source_id: None,
            idempotency_key: None,
            description: None,
        }
    }
}

/// Result of a `consume` call.
///
/// Insufficiency is an expected outcome the caller branches on, not an
/// error; the current balance is always reported so the caller can render
/// "only N remaining".
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    /// The deduction was applied.
    Applied {
        /// The recorded transaction.
        transaction: CreditTransaction,
    },

    /// A credit balance was too low; nothing was mutated.
    InsufficientBalance {
        /// The current balance.
        balance: i64,
    },
}

impl ConsumeOutcome {
    /// Whether the deduction was applied.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// The balance to report to the caller.
    #[must_use]
    pub fn balance(&self) -> i64 {
        match self {
            Self::Applied { transaction } => transaction.balance_after,
            Self::InsufficientBalance { balance } => *balance,
        }
    }
}

/// Atomic balance operator over a [`Store`].
pub struct LedgerService {
    store: Arc<dyn Store>,
    config: Arc<BillingConfig>,
    events: EventSink,
}

impl LedgerService {
    /// Create a new ledger service.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Arc<BillingConfig>, events: EventSink) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Add `amount` (> 0) to a balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a non-positive amount.
    /// - [`LedgerError::IdempotencyConflict`] for a replayed key.
    /// - [`LedgerError::CurrencyMismatch`] for a wallet currency change.
    pub async fn grant(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        ensure_positive(amount)?;
        let tx = self
            .store
            .apply(&self.write(user_id, key, WriteMode::Add { amount }, TransactionType::Grant, meta))
            .await
            .map_err(LedgerError::from)?;

        tracing::info!(
            user_id = %user_id,
            key = %key,
            amount = %amount,
            new_balance = %tx.balance_after,
            source = %tx.source,
            "Credits granted"
        );
        self.events.credits_granted(CreditsGranted {
            user_id: *user_id,
            key: key.clone(),
            amount,
            balance: tx.balance_after,
            source: tx.source,
        });
        Ok(tx)
    }

    /// Deduct `amount` (> 0) from a balance.
    ///
    /// Credit keys refuse to go negative and report
    /// [`ConsumeOutcome::InsufficientBalance`]; the wallet key always
    /// succeeds and may go negative.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a non-positive amount.
    /// - [`LedgerError::IdempotencyConflict`] for a replayed key.
    pub async fn consume(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<ConsumeOutcome> {
        ensure_positive(amount)?;
        let mode = WriteMode::Subtract {
            amount,
            allow_negative: key.is_wallet(),
        };
        match self
            .store
            .apply(&self.write(user_id, key, mode, TransactionType::Consume, meta))
            .await
        {
            Ok(tx) => {
                tracing::debug!(
                    user_id = %user_id,
                    key = %key,
                    amount = %amount,
                    new_balance = %tx.balance_after,
                    "Credits consumed"
                );
                self.check_low_balance(user_id, key, tx.balance_after, amount);
                Ok(ConsumeOutcome::Applied { transaction: tx })
            }
            Err(StoreError::InsufficientBalance { balance, required }) => {
                tracing::debug!(
                    user_id = %user_id,
                    key = %key,
                    balance = %balance,
                    required = %required,
                    "Consume rejected: insufficient balance"
                );
                Ok(ConsumeOutcome::InsufficientBalance { balance })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove `amount` (> 0) from a balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a non-positive amount.
    /// - [`LedgerError::InsufficientBalance`] when a credit balance holds
    ///   less than `amount`.
    pub async fn revoke(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        ensure_positive(amount)?;
        let mode = WriteMode::Subtract {
            amount,
            allow_negative: key.is_wallet(),
        };
        let tx = self
            .store
            .apply(&self.write(user_id, key, mode, TransactionType::Revoke, meta))
            .await
            .map_err(LedgerError::from)?;

        tracing::info!(
            user_id = %user_id,
            key = %key,
            amount = %amount,
            new_balance = %tx.balance_after,
            source = %tx.source,
            "Credits revoked"
        );
        self.events.credits_revoked(CreditsRevoked {
            user_id: *user_id,
            key: key.clone(),
            amount,
            balance: tx.balance_after,
            source: tx.source,
        });
        Ok(tx)
    }

    /// Remove everything a balance holds, recording a revoke of the full
    /// remainder. Returns `None` when the balance is already zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn revoke_all(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        meta: OperationMeta,
    ) -> Result<Option<CreditTransaction>> {
        let current = self
            .store
            .balance(user_id, key)
            .await
            .map_err(LedgerError::from)?
            .map_or(0, |r| r.balance);
        if current == 0 {
            return Ok(None);
        }

        let tx = self
            .store
            .apply(&self.write(
                user_id,
                key,
                WriteMode::Set { target: 0 },
                TransactionType::Revoke,
                meta,
            ))
            .await
            .map_err(LedgerError::from)?;

        tracing::info!(
            user_id = %user_id,
            key = %key,
            amount = %tx.amount,
            source = %tx.source,
            "Balance revoked in full"
        );
        self.events.credits_revoked(CreditsRevoked {
            user_id: *user_id,
            key: key.clone(),
            amount: tx.amount.abs(),
            balance: tx.balance_after,
            source: tx.source,
        });
        Ok(Some(tx))
    }

    /// Overwrite a balance, recording an `adjust` transaction with the delta
    /// from the prior balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a negative target on a credit key.
    /// - [`LedgerError::IdempotencyConflict`] for a replayed key.
    pub async fn set_balance(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        target: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        if target < 0 && !key.is_wallet() {
            return Err(LedgerError::InvalidAmount(target));
        }
        let tx = self
            .store
            .apply(&self.write(
                user_id,
                key,
                WriteMode::Set { target },
                TransactionType::Adjust,
                meta,
            ))
            .await
            .map_err(LedgerError::from)?;

        tracing::info!(
            user_id = %user_id,
            key = %key,
            target = %target,
            delta = %tx.amount,
            source = %tx.source,
            "Balance set"
        );
        Ok(tx)
    }

    /// Read a balance. A never-written pair reads as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_balance(&self, user_id: &UserId, key: &BalanceKey) -> Result<BalanceRecord> {
        Ok(self
            .store
            .balance(user_id, key)
            .await
            .map_err(LedgerError::from)?
            .unwrap_or_else(|| BalanceRecord::empty(*user_id, key.clone())))
    }

    /// Read every balance a user holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_all_balances(&self, user_id: &UserId) -> Result<Vec<BalanceRecord>> {
        self.store
            .balances(user_id)
            .await
            .map_err(LedgerError::from)
    }

    /// Whether the balance holds at least `amount`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn has_credits(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
    ) -> Result<bool> {
        Ok(self.get_balance(user_id, key).await?.balance >= amount)
    }

    /// Transaction history for a pair, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_history(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>> {
        self.store
            .history(user_id, key, limit, offset)
            .await
            .map_err(LedgerError::from)
    }

    fn write(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        mode: WriteMode,
        transaction_type: TransactionType,
        meta: OperationMeta,
    ) -> LedgerWrite {
        LedgerWrite {
            user_id: *user_id,
            key: key.clone(),
            mode,
            transaction_type,
            source: meta.source,
            source_id: meta.source_id,
            idempotency_key: meta.idempotency_key,
            description: meta.description,
            currency: self.config.ledger_currency(key),
        }
    }

    fn check_low_balance(&self, user_id: &UserId, key: &BalanceKey, balance: i64, consumed: i64) {
        let Some(threshold) = self.config.low_balance_threshold(key) else {
            return;
        };
        // Fire only on the crossing, not on every consume below the line.
        if balance < threshold && balance + consumed >= threshold {
            self.events.balance_low(BalanceLow {
                user_id: *user_id,
                key: key.clone(),
                balance,
                threshold,
            });
        }
    }
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}
