//! Credit/wallet ledger engine.
//!
//! tally sits between an application, its payment provider, and a Postgres
//! ledger. It grants, consumes, and replenishes per-user balances tied to
//! subscription lifecycle events, and stays consistent under concurrent
//! requests, duplicate webhook deliveries, and payment failures.
//!
//! # Components
//!
//! - [`LedgerService`]: atomic balance mutation with idempotency-key
//!   deduplication and constraint enforcement.
//! - [`TopUpService`]: on-demand and automatic top-ups, decline
//!   classification, and the cooldown/strike retry state machine.
//! - [`LifecycleService`]: subscription-event → ledger reconciliation
//!   (created, renewed, plan-changed, cancelled).
//! - [`Billing`]: facade wiring the three together over a shared
//!   [`tally_store::Store`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally::{Billing, BillingConfig, NoopEvents};
//! use tally::stripe::StripeClient;
//! # use tally::gateway::{CustomerDirectory, CustomerProfile};
//! # use tally_core::UserId;
//! # struct Directory;
//! # #[async_trait::async_trait]
//! # impl CustomerDirectory for Directory {
//! #     async fn profile(&self, _: &UserId) -> tally_core::Result<Option<CustomerProfile>> {
//! #         Ok(None)
//! #     }
//! # }
//!
//! # async fn run(config: BillingConfig) -> tally_core::Result<()> {
//! let store = Arc::new(tally_store::PgStore::connect("postgres://localhost/tally").await?);
//! let stripe = Arc::new(StripeClient::new("sk_test_xxx", "https://app.example/billing"));
//! let billing = Billing::new(
//!     store,
//!     config,
//!     stripe.clone(),
//!     stripe,
//!     Arc::new(Directory),
//!     Arc::new(NoopEvents),
//! );
//!
//! let user = UserId::generate();
//! let key = "api_calls".parse()?;
//! let outcome = billing.consume(&user, &key, 5, None, None).await?;
//! println!("success={} balance={}", outcome.success(), outcome.balance());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod stripe;
pub mod topup;

pub use config::{
    AutoTopUpConfig, BillingConfig, CreditTypeConfig, EnvConfig, PlanAllocation, PlanConfig,
    RenewalPolicy, WalletConfig,
};
pub use events::{
    AutoTopUpFailed, BalanceLow, BillingEvents, CreditsGranted, CreditsRevoked, EventSink,
    NoopEvents, TopUpCompleted,
};
pub use gateway::{ChargeGateway, ChargeOutcome, CustomerDirectory, CustomerProfile, SubscriptionGateway};
pub use ledger::{ConsumeOutcome, LedgerService, OperationMeta};
pub use lifecycle::LifecycleService;
pub use topup::{AutoTopUpFailure, AutoTopUpOutcome, SkipReason, TopUpOutcome, TopUpService};

use std::sync::Arc;

use tally_core::{
    BalanceKey, BalanceRecord, CreditTransaction, InvoiceId, PaymentIntentId, PriceId, Result,
    SubscriptionSnapshot, TransactionSource, UserId,
};
use tally_store::Store;

/// Facade wiring the ledger, top-up, and lifecycle services over one store.
///
/// Constructed once per process and shared by reference; holds no mutable
/// state of its own — every balance read and write goes to the store.
pub struct Billing {
    config: Arc<BillingConfig>,
    ledger: Arc<LedgerService>,
    topup: Arc<TopUpService>,
    lifecycle: LifecycleService,
}

impl Billing {
    /// Wire up the engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: BillingConfig,
        charges: Arc<dyn ChargeGateway>,
        subscriptions: Arc<dyn SubscriptionGateway>,
        customers: Arc<dyn CustomerDirectory>,
        events: Arc<dyn BillingEvents>,
    ) -> Self {
        let config = Arc::new(config);
        let sink = EventSink::new(events);
        let ledger = Arc::new(LedgerService::new(
            Arc::clone(&store),
            Arc::clone(&config),
            sink.clone(),
        ));
        let topup = Arc::new(TopUpService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            charges,
            customers,
            Arc::clone(&config),
            sink,
        ));
        let lifecycle = LifecycleService::new(
            Arc::clone(&ledger),
            subscriptions,
            Arc::clone(&config),
        );
        Self {
            config,
            ledger,
            topup,
            lifecycle,
        }
    }

    /// The ledger service.
    #[must_use]
    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// The top-up service.
    #[must_use]
    pub fn topup(&self) -> &TopUpService {
        &self.topup
    }

    /// The lifecycle service.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleService {
        &self.lifecycle
    }

    // =========================================================================
    // Ledger surface
    // =========================================================================

    /// Deduct usage from a balance and, when the balance drops below the
    /// configured threshold, kick off an automatic top-up in the background.
    ///
    /// The consume result is returned immediately; the top-up attempt runs
    /// fire-and-forget, reporting only through the notification hooks.
    ///
    /// # Errors
    ///
    /// See [`LedgerService::consume`]. Insufficiency is an `Ok` outcome, not
    /// an error.
    pub async fn consume(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        description: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<ConsumeOutcome> {
        let meta = OperationMeta {
            source: TransactionSource::Usage,
            source_id: None,
            idempotency_key,
            description,
        };
        let outcome = self.ledger.consume(user_id, key, amount, meta).await?;

        if let ConsumeOutcome::Applied { transaction } = &outcome {
            if self.config.auto_top_up(key).is_some() {
                let topup = Arc::clone(&self.topup);
                let user_id = *user_id;
                let key = key.clone();
                let balance = transaction.balance_after;
                tokio::spawn(async move {
                    if let Err(err) = topup
                        .trigger_auto_top_up_if_needed(&user_id, &key, balance)
                        .await
                    {
                        tracing::warn!(
                            user_id = %user_id,
                            key = %key,
                            error = %err,
                            "Background auto top-up attempt failed"
                        );
                    }
                });
            }
        }
        Ok(outcome)
    }

    /// Add credits with a manual source. See [`LedgerService::grant`].
    ///
    /// # Errors
    ///
    /// See [`LedgerService::grant`].
    pub async fn grant(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        self.ledger.grant(user_id, key, amount, meta).await
    }

    /// Remove credits. See [`LedgerService::revoke`].
    ///
    /// # Errors
    ///
    /// See [`LedgerService::revoke`].
    pub async fn revoke(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        self.ledger.revoke(user_id, key, amount, meta).await
    }

    /// Overwrite a balance. See [`LedgerService::set_balance`].
    ///
    /// # Errors
    ///
    /// See [`LedgerService::set_balance`].
    pub async fn set_balance(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        target: i64,
        meta: OperationMeta,
    ) -> Result<CreditTransaction> {
        self.ledger.set_balance(user_id, key, target, meta).await
    }

    /// Read one balance.
    ///
    /// # Errors
    ///
    /// See [`LedgerService::get_balance`].
    pub async fn get_balance(&self, user_id: &UserId, key: &BalanceKey) -> Result<BalanceRecord> {
        self.ledger.get_balance(user_id, key).await
    }

    /// Read all balances for a user.
    ///
    /// # Errors
    ///
    /// See [`LedgerService::get_all_balances`].
    pub async fn get_all_balances(&self, user_id: &UserId) -> Result<Vec<BalanceRecord>> {
        self.ledger.get_all_balances(user_id).await
    }

    /// Whether a balance holds at least `amount`.
    ///
    /// # Errors
    ///
    /// See [`LedgerService::has_credits`].
    pub async fn has_credits(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
    ) -> Result<bool> {
        self.ledger.has_credits(user_id, key, amount).await
    }

    /// Transaction history, newest first.
    ///
    /// # Errors
    ///
    /// See [`LedgerService::get_history`].
    pub async fn get_history(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>> {
        self.ledger.get_history(user_id, key, limit, offset).await
    }

    // =========================================================================
    // Top-up surface
    // =========================================================================

    /// User-initiated top-up. See [`TopUpService::top_up`].
    ///
    /// # Errors
    ///
    /// See [`TopUpService::top_up`].
    pub async fn top_up(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Result<TopUpOutcome> {
        self.topup.top_up(user_id, key, amount, idempotency_key).await
    }

    /// Webhook-confirmed payment. See [`TopUpService::on_payment_succeeded`].
    ///
    /// # Errors
    ///
    /// See [`TopUpService::on_payment_succeeded`].
    pub async fn on_payment_succeeded(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        payment_intent: &PaymentIntentId,
        automatic: bool,
    ) -> Result<()> {
        self.topup
            .on_payment_succeeded(user_id, key, amount, payment_intent, automatic)
            .await
    }

    /// Payment-method change. See [`TopUpService::on_payment_method_updated`].
    ///
    /// # Errors
    ///
    /// See [`TopUpService::on_payment_method_updated`].
    pub async fn on_payment_method_updated(&self, user_id: &UserId) -> Result<()> {
        self.topup.on_payment_method_updated(user_id).await
    }

    // =========================================================================
    // Lifecycle surface (consumed by the webhook boundary)
    // =========================================================================

    /// See [`LifecycleService::on_subscription_created`].
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::on_subscription_created`].
    pub async fn on_subscription_created(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
    ) -> Result<()> {
        self.lifecycle
            .on_subscription_created(user_id, subscription)
            .await
    }

    /// See [`LifecycleService::on_subscription_renewed`].
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::on_subscription_renewed`].
    pub async fn on_subscription_renewed(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        invoice_id: &InvoiceId,
    ) -> Result<()> {
        self.lifecycle
            .on_subscription_renewed(user_id, subscription, invoice_id)
            .await
    }

    /// See [`LifecycleService::on_subscription_plan_changed`].
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::on_subscription_plan_changed`].
    pub async fn on_subscription_plan_changed(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        previous_price: &PriceId,
    ) -> Result<()> {
        self.lifecycle
            .on_subscription_plan_changed(user_id, subscription, previous_price)
            .await
    }

    /// See [`LifecycleService::on_downgrade_applied`].
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::on_downgrade_applied`].
    pub async fn on_downgrade_applied(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        current_price: &PriceId,
    ) -> Result<()> {
        self.lifecycle
            .on_downgrade_applied(user_id, subscription, current_price)
            .await
    }

    /// See [`LifecycleService::on_subscription_cancelled`].
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::on_subscription_cancelled`].
    pub async fn on_subscription_cancelled(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
    ) -> Result<()> {
        self.lifecycle
            .on_subscription_cancelled(user_id, subscription)
            .await
    }
}
