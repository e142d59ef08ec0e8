//! Boundary traits for external collaborators.
//!
//! The engine never talks to the payment provider or the customer mapping
//! directly; it goes through these traits. Production wires in the Stripe
//! client from [`crate::stripe`]; tests wire in scripted mocks.

use async_trait::async_trait;

use tally_core::{
    CustomerId, PaymentIntentId, PaymentMethodId, Result, SubscriptionId, SubscriptionSnapshot,
    UserId,
};

/// Outcome of a charge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The charge settled.
    Succeeded {
        /// The created payment intent.
        payment_intent: PaymentIntentId,
    },

    /// The charge is in flight; a webhook will report the final state.
    Processing {
        /// The created payment intent.
        payment_intent: PaymentIntentId,
    },

    /// The charge was declined or needs user action.
    Failed {
        /// The payment intent, when the provider created one.
        payment_intent: Option<PaymentIntentId>,
        /// Raw network decline code, if any.
        decline_code: Option<String>,
    },
}

/// Charges payment methods and mints recovery-checkout URLs.
#[async_trait]
pub trait ChargeGateway: Send + Sync {
    /// Charge a customer's payment method off-session.
    ///
    /// The idempotency key makes the charge at-most-once on the provider
    /// side; a redelivered trigger reuses the original attempt.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures that are not
    /// decline outcomes (declines are [`ChargeOutcome::Failed`]).
    async fn charge(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        currency: &str,
        payment_method: &PaymentMethodId,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome>;

    /// Create a checkout URL the user can be sent to in order to supply a
    /// new payment method and complete a specific top-up.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn recovery_url(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        currency: &str,
    ) -> Result<String>;

    /// The customer's default payment method, if one is on file.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn default_payment_method(
        &self,
        customer: &CustomerId,
    ) -> Result<Option<PaymentMethodId>>;
}

/// Reads and maintains subscription state in the provider mirror.
#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    /// Fetch a subscription snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn subscription(&self, id: &SubscriptionId) -> Result<Option<SubscriptionSnapshot>>;

    /// All currently active subscriptions for a customer.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn active_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<SubscriptionSnapshot>>;

    /// Write metadata entries on a subscription. An empty value deletes the
    /// key.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn update_metadata(
        &self,
        id: &SubscriptionId,
        entries: &[(String, String)],
    ) -> Result<()>;

    /// Cancel a subscription immediately.
    ///
    /// # Errors
    ///
    /// Returns an error for transport or provider failures.
    async fn cancel(&self, id: &SubscriptionId) -> Result<()>;
}

/// The resolved payment identity of a user.
#[derive(Debug, Clone)]
pub struct CustomerProfile {
    /// Provider customer id.
    pub customer_id: CustomerId,

    /// Default payment method, if one is on file.
    pub default_payment_method: Option<PaymentMethodId>,
}

/// Maps application users to provider customers.
///
/// The embedding application owns this mapping; the engine only consumes it.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    /// The customer profile for a user, or `None` when the user has no
    /// payment identity yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    async fn profile(&self, user_id: &UserId) -> Result<Option<CustomerProfile>>;
}
