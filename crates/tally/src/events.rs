//! Notification hooks.
//!
//! The embedding application observes billing activity by implementing
//! [`BillingEvents`]. Every hook is fire-and-forget: the engine spawns the
//! callback and never awaits it on the caller's path, so a slow or panicking
//! observer cannot fail or delay the operation that fired it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{BalanceKey, DeclineType, PaymentIntentId, TransactionSource, UserId};

/// Parameters for [`BillingEvents::credits_granted`].
#[derive(Debug, Clone)]
pub struct CreditsGranted {
    /// The user credited.
    pub user_id: UserId,
    /// The balance key credited.
    pub key: BalanceKey,
    /// Units added.
    pub amount: i64,
    /// Balance after the grant.
    pub balance: i64,
    /// What triggered the grant.
    pub source: TransactionSource,
}

/// Parameters for [`BillingEvents::credits_revoked`].
#[derive(Debug, Clone)]
pub struct CreditsRevoked {
    /// The user debited.
    pub user_id: UserId,
    /// The balance key debited.
    pub key: BalanceKey,
    /// Units removed (positive).
    pub amount: i64,
    /// Balance after the revoke.
    pub balance: i64,
    /// What triggered the revoke.
    pub source: TransactionSource,
}

/// Parameters for [`BillingEvents::balance_low`].
#[derive(Debug, Clone)]
pub struct BalanceLow {
    /// The user whose balance crossed the threshold.
    pub user_id: UserId,
    /// The balance key.
    pub key: BalanceKey,
    /// Current balance.
    pub balance: i64,
    /// The configured threshold that was crossed.
    pub threshold: i64,
}

/// Parameters for [`BillingEvents::top_up_completed`].
#[derive(Debug, Clone)]
pub struct TopUpCompleted {
    /// The user topped up.
    pub user_id: UserId,
    /// The balance key topped up.
    pub key: BalanceKey,
    /// Units credited.
    pub amount: i64,
    /// Balance after the credit, when the ledger write succeeded.
    pub balance: Option<i64>,
    /// The charge that paid for the top-up.
    pub payment_intent: PaymentIntentId,
    /// Whether the top-up was automatic (vs. user-initiated).
    pub automatic: bool,
}

/// Parameters for [`BillingEvents::auto_top_up_failed`].
#[derive(Debug, Clone)]
pub struct AutoTopUpFailed {
    /// The user whose top-up failed.
    pub user_id: UserId,
    /// The balance key.
    pub key: BalanceKey,
    /// Classification of the decline.
    pub decline_type: DeclineType,
    /// Raw decline code, if the network sent one.
    pub decline_code: Option<String>,
    /// Consecutive failures including this one.
    pub failure_count: u32,
    /// When the next automatic attempt becomes eligible, if one will happen.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Whether attempts are now blocked until the card is updated.
    pub blocked: bool,
}

/// Observer interface for billing activity.
///
/// All methods default to no-ops so implementors only override what they
/// care about.
#[async_trait]
pub trait BillingEvents: Send + Sync {
    /// A balance was credited.
    async fn credits_granted(&self, event: CreditsGranted) {
        let _ = event;
    }

    /// A balance was debited by a revoke.
    async fn credits_revoked(&self, event: CreditsRevoked) {
        let _ = event;
    }

    /// A balance crossed below its configured threshold.
    async fn balance_low(&self, event: BalanceLow) {
        let _ = event;
    }

    /// A top-up charge succeeded.
    async fn top_up_completed(&self, event: TopUpCompleted) {
        let _ = event;
    }

    /// An automatic top-up attempt failed.
    async fn auto_top_up_failed(&self, event: AutoTopUpFailed) {
        let _ = event;
    }
}

/// The default observer: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

#[async_trait]
impl BillingEvents for NoopEvents {}

/// Fire-and-forget dispatcher wrapping the configured observer.
#[derive(Clone)]
pub struct EventSink {
    events: Arc<dyn BillingEvents>,
}

impl EventSink {
    /// Wrap an observer.
    #[must_use]
    pub fn new(events: Arc<dyn BillingEvents>) -> Self {
        Self { events }
    }

    /// Dispatch `credits_granted` without blocking the caller.
    pub fn credits_granted(&self, event: CreditsGranted) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move { events.credits_granted(event).await });
    }

    /// Dispatch `credits_revoked` without blocking the caller.
    pub fn credits_revoked(&self, event: CreditsRevoked) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move { events.credits_revoked(event).await });
    }

    /// Dispatch `balance_low` without blocking the caller.
    pub fn balance_low(&self, event: BalanceLow) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move { events.balance_low(event).await });
    }

    /// Dispatch `top_up_completed` without blocking the caller.
    pub fn top_up_completed(&self, event: TopUpCompleted) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move { events.top_up_completed(event).await });
    }

    /// Dispatch `auto_top_up_failed` without blocking the caller.
    pub fn auto_top_up_failed(&self, event: AutoTopUpFailed) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move { events.auto_top_up_failed(event).await });
    }
}
