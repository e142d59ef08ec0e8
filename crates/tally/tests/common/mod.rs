//! Common test utilities for tally integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tally::gateway::{
    ChargeGateway, ChargeOutcome, CustomerDirectory, CustomerProfile, SubscriptionGateway,
};
use tally::{
    AutoTopUpFailed, BalanceLow, Billing, BillingConfig, BillingEvents, CreditTypeConfig,
    CreditsGranted, CreditsRevoked, PlanAllocation, PlanConfig, RenewalPolicy, TopUpCompleted,
    WalletConfig,
};
use tally_core::{
    BalanceKey, BillingInterval, CustomerId, PaymentIntentId, PaymentMethodId, PriceId, Result,
    SubscriptionId, SubscriptionSnapshot, SubscriptionStatus, TransactionId, UserId,
};
use tally_store::MemoryStore;

/// Parse a balance key literal.
pub fn key(s: &str) -> BalanceKey {
    s.parse().expect("valid balance key")
}

/// Parse a price id literal.
pub fn price(s: &str) -> PriceId {
    s.parse().expect("valid price id")
}

/// A subscription snapshot with sane defaults.
pub fn snapshot(id: &str, customer: &str, price_id: &str) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        id: id.parse().expect("valid subscription id"),
        customer_id: customer.parse().expect("valid customer id"),
        status: SubscriptionStatus::Active,
        price_id: price(price_id),
        current_period_start: Utc::now(),
        current_period_end: Utc::now() + chrono::Duration::days(30),
        cancel_at_period_end: false,
        metadata: std::collections::BTreeMap::new(),
    }
}

fn plan(
    price_id: &str,
    amount_cents: i64,
    interval: BillingInterval,
    allocations: &[(&str, i64)],
) -> PlanConfig {
    PlanConfig {
        price_id: price(price_id),
        amount_cents,
        interval,
        allocations: allocations
            .iter()
            .map(|(k, monthly_amount)| PlanAllocation {
                key: key(k),
                monthly_amount: *monthly_amount,
            })
            .collect(),
    }
}

/// The plan catalog and key configuration the suites share.
pub fn test_config() -> BillingConfig {
    BillingConfig {
        credit_types: vec![CreditTypeConfig {
            key: key("api_calls"),
            on_renewal: RenewalPolicy::Reset,
            low_balance_threshold: None,
            top_up_unit_price_milli_cents: Some(10),
            auto_top_up: None,
        }],
        wallet: Some(WalletConfig {
            currency: "usd".into(),
            on_renewal: RenewalPolicy::Reset,
            low_balance_threshold: None,
            auto_top_up: None,
        }),
        plans: vec![
            plan("price_free", 0, BillingInterval::Month, &[("api_calls", 100)]),
            plan(
                "price_basic",
                1000,
                BillingInterval::Month,
                &[("api_calls", 500)],
            ),
            plan(
                "price_pro",
                2000,
                BillingInterval::Month,
                &[("api_calls", 1000)],
            ),
            plan(
                "price_pro_yearly",
                20_000,
                BillingInterval::Year,
                &[("api_calls", 1000)],
            ),
            plan(
                "price_wallet",
                500,
                BillingInterval::Month,
                &[("wallet", 500)],
            ),
        ],
        default_currency: "usd".into(),
    }
}

/// A recorded charge attempt.
#[derive(Debug, Clone)]
pub struct ChargeCall {
    pub customer: CustomerId,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethodId,
    pub idempotency_key: String,
}

/// Scripted charge gateway: pops queued outcomes, defaults to success.
#[derive(Default)]
pub struct MockChargeGateway {
    outcomes: Mutex<VecDeque<ChargeOutcome>>,
    pub calls: Mutex<Vec<ChargeCall>>,
}

impl MockChargeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next charge.
    pub fn push_outcome(&self, outcome: ChargeOutcome) {
        self.outcomes
            .lock()
            .expect("gateway lock poisoned")
            .push_back(outcome);
    }

    /// Queue a decline with the given code.
    pub fn push_decline(&self, decline_code: &str) {
        self.push_outcome(ChargeOutcome::Failed {
            payment_intent: Some(generate_intent()),
            decline_code: Some(decline_code.to_string()),
        });
    }

    pub fn calls(&self) -> Vec<ChargeCall> {
        self.calls.lock().expect("gateway lock poisoned").clone()
    }
}

fn generate_intent() -> PaymentIntentId {
    format!("pi_{}", TransactionId::generate())
        .parse()
        .expect("valid payment intent id")
}

#[async_trait]
impl ChargeGateway for MockChargeGateway {
    async fn charge(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        currency: &str,
        payment_method: &PaymentMethodId,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome> {
        self.calls.lock().expect("gateway lock poisoned").push(ChargeCall {
            customer: customer.clone(),
            amount_cents,
            currency: currency.to_string(),
            payment_method: payment_method.clone(),
            idempotency_key: idempotency_key.to_string(),
        });
        let queued = self
            .outcomes
            .lock()
            .expect("gateway lock poisoned")
            .pop_front();
        Ok(queued.unwrap_or(ChargeOutcome::Succeeded {
            payment_intent: generate_intent(),
        }))
    }

    async fn recovery_url(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        _currency: &str,
    ) -> Result<String> {
        Ok(format!(
            "https://checkout.test/recover/{customer}/{amount_cents}"
        ))
    }

    async fn default_payment_method(
        &self,
        _customer: &CustomerId,
    ) -> Result<Option<PaymentMethodId>> {
        Ok(None)
    }
}

/// In-memory subscription mirror with recorded cancels and metadata writes.
#[derive(Default)]
pub struct MockSubscriptionGateway {
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    pub cancelled: Mutex<Vec<SubscriptionId>>,
    pub metadata_writes: Mutex<Vec<(SubscriptionId, Vec<(String, String)>)>>,
}

impl MockSubscriptionGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sub: SubscriptionSnapshot) {
        self.subscriptions
            .lock()
            .expect("gateway lock poisoned")
            .insert(sub.id.to_string(), sub);
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<SubscriptionSnapshot> {
        self.subscriptions
            .lock()
            .expect("gateway lock poisoned")
            .get(id.as_str())
            .cloned()
    }

    pub fn cancelled_ids(&self) -> Vec<SubscriptionId> {
        self.cancelled.lock().expect("gateway lock poisoned").clone()
    }
}

#[async_trait]
impl SubscriptionGateway for MockSubscriptionGateway {
    async fn subscription(&self, id: &SubscriptionId) -> Result<Option<SubscriptionSnapshot>> {
        Ok(self.get(id))
    }

    async fn active_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<SubscriptionSnapshot>> {
        Ok(self
            .subscriptions
            .lock()
            .expect("gateway lock poisoned")
            .values()
            .filter(|s| s.customer_id == *customer && s.status.is_active())
            .cloned()
            .collect())
    }

    async fn update_metadata(
        &self,
        id: &SubscriptionId,
        entries: &[(String, String)],
    ) -> Result<()> {
        let mut subs = self.subscriptions.lock().expect("gateway lock poisoned");
        if let Some(sub) = subs.get_mut(id.as_str()) {
            for (k, v) in entries {
                if v.is_empty() {
                    sub.metadata.remove(k);
                } else {
                    sub.metadata.insert(k.clone(), v.clone());
                }
            }
        }
        self.metadata_writes
            .lock()
            .expect("gateway lock poisoned")
            .push((id.clone(), entries.to_vec()));
        Ok(())
    }

    async fn cancel(&self, id: &SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.lock().expect("gateway lock poisoned");
        if let Some(sub) = subs.get_mut(id.as_str()) {
            sub.status = SubscriptionStatus::Canceled;
        }
        self.cancelled
            .lock()
            .expect("gateway lock poisoned")
            .push(id.clone());
        Ok(())
    }
}

/// Static user → customer mapping.
#[derive(Default)]
pub struct MockDirectory {
    profiles: Mutex<HashMap<UserId, CustomerProfile>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: UserId, customer: &str, payment_method: Option<&str>) {
        self.profiles.lock().expect("directory lock poisoned").insert(
            user_id,
            CustomerProfile {
                customer_id: customer.parse().expect("valid customer id"),
                default_payment_method: payment_method
                    .map(|pm| pm.parse().expect("valid payment method id")),
            },
        );
    }
}

#[async_trait]
impl CustomerDirectory for MockDirectory {
    async fn profile(&self, user_id: &UserId) -> Result<Option<CustomerProfile>> {
        Ok(self
            .profiles
            .lock()
            .expect("directory lock poisoned")
            .get(user_id)
            .cloned())
    }
}

/// Observer that records every notification for assertions.
#[derive(Default)]
pub struct RecordingEvents {
    pub granted: Mutex<Vec<CreditsGranted>>,
    pub revoked: Mutex<Vec<CreditsRevoked>>,
    pub low: Mutex<Vec<BalanceLow>>,
    pub completed: Mutex<Vec<TopUpCompleted>>,
    pub failed: Mutex<Vec<AutoTopUpFailed>>,
}

#[async_trait]
impl BillingEvents for RecordingEvents {
    async fn credits_granted(&self, event: CreditsGranted) {
        self.granted.lock().expect("events lock poisoned").push(event);
    }

    async fn credits_revoked(&self, event: CreditsRevoked) {
        self.revoked.lock().expect("events lock poisoned").push(event);
    }

    async fn balance_low(&self, event: BalanceLow) {
        self.low.lock().expect("events lock poisoned").push(event);
    }

    async fn top_up_completed(&self, event: TopUpCompleted) {
        self.completed.lock().expect("events lock poisoned").push(event);
    }

    async fn auto_top_up_failed(&self, event: AutoTopUpFailed) {
        self.failed.lock().expect("events lock poisoned").push(event);
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub charges: Arc<MockChargeGateway>,
    pub subscriptions: Arc<MockSubscriptionGateway>,
    pub customers: Arc<MockDirectory>,
    pub events: Arc<RecordingEvents>,
    pub billing: Billing,
    pub user_id: UserId,
}

impl TestHarness {
    /// Create a harness with the shared test configuration.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let charges = Arc::new(MockChargeGateway::new());
        let subscriptions = Arc::new(MockSubscriptionGateway::new());
        let customers = Arc::new(MockDirectory::new());
        let events = Arc::new(RecordingEvents::default());

        let billing = Billing::new(
            Arc::clone(&store) as Arc<dyn tally_store::Store>,
            config,
            Arc::clone(&charges) as Arc<dyn ChargeGateway>,
            Arc::clone(&subscriptions) as Arc<dyn SubscriptionGateway>,
            Arc::clone(&customers) as Arc<dyn CustomerDirectory>,
            Arc::clone(&events) as Arc<dyn BillingEvents>,
        );

        Self {
            store,
            charges,
            subscriptions,
            customers,
            events,
            billing,
            user_id: UserId::generate(),
        }
    }

    /// Register the harness user with a customer and payment method.
    pub fn with_payment_method(self) -> Self {
        self.customers
            .insert(self.user_id, "cus_test", Some("pm_1NXWPnLkdIwHu7ix"));
        self
    }

    /// Let fire-and-forget tasks (notifications, background top-ups) run.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
