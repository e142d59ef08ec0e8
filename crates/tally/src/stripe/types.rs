//! Stripe API response types (the subset this crate consumes).

use serde::Deserialize;
use std::collections::BTreeMap;

/// A payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    /// Payment intent id (`pi_...`).
    pub id: String,
    /// Intent status (`succeeded`, `processing`, `requires_action`, ...).
    pub status: String,
    /// The most recent payment error, when the intent is not settled.
    pub last_payment_error: Option<LastPaymentError>,
}

/// Error details on an unsettled payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct LastPaymentError {
    /// Stripe error code.
    pub code: Option<String>,
    /// Card-network decline code.
    pub decline_code: Option<String>,
}

/// A checkout session.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    /// Session id (`cs_...`).
    pub id: String,
    /// Hosted checkout URL.
    pub url: Option<String>,
}

/// A customer.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerObject {
    /// Customer id (`cus_...`).
    pub id: String,
    /// Invoice settings carrying the default payment method.
    pub invoice_settings: Option<InvoiceSettings>,
}

/// Customer invoice settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSettings {
    /// Default payment method id (`pm_...`).
    pub default_payment_method: Option<String>,
}

/// A subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    /// Subscription id (`sub_...`).
    pub id: String,
    /// Owning customer id.
    pub customer: String,
    /// Subscription status string.
    pub status: String,
    /// Line items (the first item's price is the plan price).
    pub items: SubscriptionItems,
    /// Current period start (epoch seconds).
    pub current_period_start: i64,
    /// Current period end (epoch seconds).
    pub current_period_end: i64,
    /// Whether the subscription cancels at period end.
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Metadata bag.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Subscription line-item list.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItems {
    /// The items.
    pub data: Vec<SubscriptionItem>,
}

/// One subscription line item.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    /// The item's price.
    pub price: PriceObject,
}

/// A price reference.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    /// Price id (`price_...`).
    pub id: String,
}

/// A generic Stripe list envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    /// The listed objects.
    pub data: Vec<T>,
}

/// A Stripe error envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorResponse {
    /// The error body.
    pub error: StripeErrorBody,
}

/// Stripe error details.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorBody {
    /// Error type (`card_error`, `invalid_request_error`, ...).
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable message.
    pub message: Option<String>,
    /// Stripe error code.
    pub code: Option<String>,
    /// Card-network decline code (card errors only).
    pub decline_code: Option<String>,
    /// The payment intent the error relates to, when present.
    pub payment_intent: Option<PaymentIntentObject>,
}
