//! Billing configuration.
//!
//! A [`BillingConfig`] is constructed once by the embedding application and
//! passed by reference to every component; there is no process-wide
//! configuration singleton.

use serde::{Deserialize, Serialize};

use tally_core::{BalanceKey, BillingInterval, LedgerError, PriceId};

/// Milli-cents per cent.
pub const MILLI_CENTS_PER_CENT: i64 = 1000;

/// Ceiling division for signed integers.
///
/// Mirrors `i64::div_ceil` (still unstable on stable toolchains) so the
/// rounding behavior is identical, including for negative operands.
const fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

/// What a renewal does to an existing balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalPolicy {
    /// Overwrite the balance with the scaled allocation, forgiving any
    /// negative wallet debt.
    Reset,

    /// Add the scaled allocation to the existing balance.
    Add,
}

/// Automatic top-up settings for one balance key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTopUpConfig {
    /// Attempt a top-up when the balance drops below this value (in the
    /// key's unit).
    pub threshold: i64,

    /// Units credited per successful top-up.
    pub amount: i64,

    /// Maximum automatic top-ups per UTC calendar month.
    pub monthly_cap: u32,
}

/// Configuration for a named credit type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTypeConfig {
    /// The balance key this configures.
    pub key: BalanceKey,

    /// Renewal behavior for this key.
    pub on_renewal: RenewalPolicy,

    /// Fire the `balance_low` notification when the balance crosses below
    /// this value.
    pub low_balance_threshold: Option<i64>,

    /// Price per credit in milli-cents, for top-up purchases. `None` means
    /// this key cannot be topped up.
    pub top_up_unit_price_milli_cents: Option<i64>,

    /// Automatic top-up settings, if enabled for this key.
    pub auto_top_up: Option<AutoTopUpConfig>,
}

/// Configuration for the reserved wallet key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// ISO currency code for the wallet (pins the balance currency).
    pub currency: String,

    /// Renewal behavior for the wallet.
    pub on_renewal: RenewalPolicy,

    /// Fire the `balance_low` notification when the balance crosses below
    /// this value (milli-cents).
    pub low_balance_threshold: Option<i64>,

    /// Automatic top-up settings, if enabled.
    pub auto_top_up: Option<AutoTopUpConfig>,
}

/// One balance-key allocation within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAllocation {
    /// The balance key granted.
    pub key: BalanceKey,

    /// Units granted per month; scaled by the plan's billing interval.
    pub monthly_amount: i64,
}

/// A purchasable plan, keyed by its provider price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Provider price identifier.
    pub price_id: PriceId,

    /// Price amount in cents, used to order plans for upgrade/downgrade
    /// decisions.
    pub amount_cents: i64,

    /// Billing interval of the price.
    pub interval: BillingInterval,

    /// Balance allocations granted by this plan.
    pub allocations: Vec<PlanAllocation>,
}

impl PlanConfig {
    /// Allocation for `key` scaled to this plan's billing interval.
    #[must_use]
    pub fn scaled_allocation(&self, key: &BalanceKey) -> Option<i64> {
        self.allocations
            .iter()
            .find(|a| a.key == *key)
            .map(|a| self.interval.scale_allocation(a.monthly_amount))
    }
}

/// Top-level billing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Named credit types.
    pub credit_types: Vec<CreditTypeConfig>,

    /// Wallet settings, if the wallet key is in use.
    pub wallet: Option<WalletConfig>,

    /// Plan catalog.
    pub plans: Vec<PlanConfig>,

    /// Currency used to charge credit-type top-ups.
    pub default_currency: String,
}

impl BillingConfig {
    /// Look up a plan by price.
    #[must_use]
    pub fn plan(&self, price_id: &PriceId) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.price_id == *price_id)
    }

    /// Look up a credit-type configuration.
    #[must_use]
    pub fn credit_type(&self, key: &BalanceKey) -> Option<&CreditTypeConfig> {
        self.credit_types.iter().find(|c| c.key == *key)
    }

    /// Every key this deployment is configured to track.
    #[must_use]
    pub fn configured_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> =
            self.credit_types.iter().map(|c| c.key.clone()).collect();
        if self.wallet.is_some() {
            keys.push(BalanceKey::wallet());
        }
        keys
    }

    /// Renewal policy for a key; unconfigured keys default to reset.
    #[must_use]
    pub fn renewal_policy(&self, key: &BalanceKey) -> RenewalPolicy {
        if key.is_wallet() {
            self.wallet
                .as_ref()
                .map_or(RenewalPolicy::Reset, |w| w.on_renewal)
        } else {
            self.credit_type(key)
                .map_or(RenewalPolicy::Reset, |c| c.on_renewal)
        }
    }

    /// Automatic top-up settings for a key, if enabled.
    #[must_use]
    pub fn auto_top_up(&self, key: &BalanceKey) -> Option<&AutoTopUpConfig> {
        if key.is_wallet() {
            self.wallet.as_ref().and_then(|w| w.auto_top_up.as_ref())
        } else {
            self.credit_type(key).and_then(|c| c.auto_top_up.as_ref())
        }
    }

    /// Low-balance notification threshold for a key.
    #[must_use]
    pub fn low_balance_threshold(&self, key: &BalanceKey) -> Option<i64> {
        if key.is_wallet() {
            self.wallet.as_ref().and_then(|w| w.low_balance_threshold)
        } else {
            self.credit_type(key).and_then(|c| c.low_balance_threshold)
        }
    }

    /// Currency recorded on ledger writes for a key. Only wallet balances
    /// pin a currency.
    #[must_use]
    pub fn ledger_currency(&self, key: &BalanceKey) -> Option<String> {
        if key.is_wallet() {
            self.wallet.as_ref().map(|w| w.currency.clone())
        } else {
            None
        }
    }

    /// Currency a top-up of this key is charged in.
    #[must_use]
    pub fn charge_currency(&self, key: &BalanceKey) -> String {
        if key.is_wallet() {
            self.wallet
                .as_ref()
                .map_or_else(|| self.default_currency.clone(), |w| w.currency.clone())
        } else {
            self.default_currency.clone()
        }
    }

    /// Cents to charge for adding `units` to a key's balance.
    ///
    /// Wallet units are milli-cents, so the charge is the unit amount divided
    /// up to the next whole cent. Credit units are priced by the key's
    /// configured unit price.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::WalletNotConfigured`] for the wallet key without
    ///   wallet configuration.
    /// - [`LedgerError::TrackingNotEnabled`] for a credit key without a
    ///   top-up unit price.
    pub fn charge_amount_cents(&self, key: &BalanceKey, units: i64) -> Result<i64, LedgerError> {
        if key.is_wallet() {
            if self.wallet.is_none() {
                return Err(LedgerError::WalletNotConfigured);
            }
            return Ok(div_ceil_i64(units, MILLI_CENTS_PER_CENT));
        }
        let unit_price = self
            .credit_type(key)
            .and_then(|c| c.top_up_unit_price_milli_cents)
            .ok_or_else(|| LedgerError::TrackingNotEnabled {
                key: key.to_string(),
            })?;
        Ok(div_ceil_i64(units * unit_price, MILLI_CENTS_PER_CENT))
    }
}

/// Process configuration loaded from environment variables.
///
/// Deployment glue only; everything behavioral lives in [`BillingConfig`].
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// PostgreSQL connection URL (default: `postgres://localhost/tally`).
    pub database_url: String,

    /// Stripe secret API key (optional; gateway disabled without it).
    pub stripe_api_key: Option<String>,

    /// URL users land on after a recovery checkout completes.
    pub checkout_return_url: String,
}

impl EnvConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tally".into()),
            stripe_api_key: std::env::var("STRIPE_API_KEY").ok(),
            checkout_return_url: std::env::var("CHECKOUT_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing".into()),
        }
    }
}
