//! Core types for the tally credit ledger.
//!
//! This crate provides the foundational types used throughout tally:
//!
//! - **Identifiers**: `UserId`, `BalanceKey`, `TransactionId`, provider ids
//! - **Balances**: `BalanceRecord`
//! - **Ledger**: `CreditTransaction`, `LedgerWrite`, `TransactionType`,
//!   `TransactionSource`
//! - **Top-up**: `TopUpFailure`, `DeclineType`, decline classification
//! - **Subscriptions**: `SubscriptionSnapshot`, `BillingInterval`
//!
//! # Units
//!
//! Balances are integers in the smallest indivisible unit of their key:
//! whole credits for credit-type keys, milli-cents (1/1000 of a cent) for the
//! reserved `wallet` key. Integer storage keeps sub-cent per-unit pricing
//! exact.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod decline;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod subscription;
pub mod topup;

pub use balance::BalanceRecord;
pub use decline::{classify_decline, DeclineType};
pub use error::{LedgerError, Result};
pub use ids::{
    BalanceKey, CustomerId, IdError, InvoiceId, PaymentIntentId, PaymentMethodId, PriceId,
    SubscriptionId, TransactionId, UserId,
};
pub use ledger::{
    verify_chain, CreditTransaction, LedgerWrite, TransactionSource, TransactionType,
    UnknownVariant, WriteMode,
};
pub use subscription::{
    BillingInterval, SubscriptionSnapshot, SubscriptionStatus, PENDING_DOWNGRADE_KEY,
    PREVIOUS_PRICE_KEY,
};
pub use topup::{TopUpFailure, MAX_CONSECUTIVE_FAILURES, RETRY_COOLDOWN_HOURS};
