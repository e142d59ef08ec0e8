//! Subscription snapshots and billing-interval scaling.
//!
//! Snapshots are read-only inputs sourced from the provider's object mirror;
//! this crate consumes their row shape, it does not maintain them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ledger::UnknownVariant;
use crate::{CustomerId, PriceId, SubscriptionId};

/// Metadata key marking a deferred downgrade on a subscription.
pub const PENDING_DOWNGRADE_KEY: &str = "tally_pending_downgrade";

/// Metadata key carrying the price the user's current balances were granted
/// under, kept while a downgrade is pending.
pub const PREVIOUS_PRICE_KEY: &str = "tally_previous_price";

/// A read-only snapshot of a subscription from the provider mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Subscription identifier.
    pub id: SubscriptionId,

    /// Owning customer.
    pub customer_id: CustomerId,

    /// Provider-reported status.
    pub status: SubscriptionStatus,

    /// Current line-item price.
    pub price_id: PriceId,

    /// Start of the current billing period.
    pub current_period_start: DateTime<Utc>,

    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,

    /// Whether the subscription is flagged to cancel at period end.
    pub cancel_at_period_end: bool,

    /// Provider metadata bag; carries pending-downgrade markers.
    pub metadata: BTreeMap<String, String>,
}

impl SubscriptionSnapshot {
    /// The downgrade target price, if a downgrade is pending.
    #[must_use]
    pub fn pending_downgrade(&self) -> Option<PriceId> {
        self.metadata
            .get(PENDING_DOWNGRADE_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// The price the current balances were granted under, when a downgrade
    /// is pending.
    #[must_use]
    pub fn previous_price(&self) -> Option<PriceId> {
        self.metadata
            .get(PREVIOUS_PRICE_KEY)
            .and_then(|v| v.parse().ok())
    }
}

/// Provider subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active.
    Active,

    /// In a trial period.
    Trialing,

    /// Payment failed, subscription is past due.
    PastDue,

    /// Subscription has been cancelled.
    Canceled,

    /// Initial payment has not completed.
    Incomplete,
}

impl SubscriptionStatus {
    /// Whether the subscription currently entitles the user to credits.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// Billing interval of a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Weekly billing.
    Week,

    /// Monthly billing (the allocation base).
    Month,

    /// Yearly billing.
    Year,
}

impl BillingInterval {
    /// Scale a monthly allocation to this interval.
    ///
    /// Yearly grants cover twelve months up front; weekly grants a quarter
    /// month rounded up so short intervals never round to zero.
    #[must_use]
    pub const fn scale_allocation(&self, monthly: i64) -> i64 {
        match self {
            Self::Week => (monthly + 3) / 4,
            Self::Month => monthly,
            Self::Year => monthly * 12,
        }
    }

    /// Stable string form used by configuration and the provider API.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl FromStr for BillingInterval {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
