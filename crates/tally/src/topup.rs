//! Top-up orchestration.
//!
//! Drives on-demand and automatic top-up attempts: charges the payment
//! gateway, classifies outcomes, credits the ledger, and maintains the
//! failure tracker that gates automatic retries.
//!
//! # Automatic retry state machine
//!
//! Per (user, key): **clear** (no failure record) → **soft-blocked**
//! (soft decline, fewer than three consecutive failures, 24-hour cooldown
//! between attempts) → **hard-blocked** (hard decline, or third consecutive
//! soft failure). Hard-blocked pairs make no attempts until a payment-method
//! change or a successful manual top-up clears the record.
//!
//! The charge runs with no ledger lock held; the balance credit is a
//! separate atomic step once the outcome is known. A failed or timed-out
//! charge leaves the ledger untouched, and the next eligible attempt is
//! determined solely by the persisted failure record.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};

use tally_core::{
    classify_decline, BalanceKey, DeclineType, LedgerError, PaymentIntentId, Result,
    TransactionSource, UserId, MAX_CONSECUTIVE_FAILURES,
};
use tally_store::Store;

use crate::config::BillingConfig;
use crate::events::{AutoTopUpFailed, EventSink, TopUpCompleted};
use crate::gateway::{ChargeGateway, ChargeOutcome, CustomerDirectory, CustomerProfile};
use crate::ledger::{LedgerService, OperationMeta};

/// Outcome of an on-demand top-up.
#[derive(Debug, Clone)]
pub enum TopUpOutcome {
    /// The charge settled and the balance was credited.
    Succeeded {
        /// Balance after the credit, when the ledger write succeeded.
        new_balance: Option<i64>,
        /// The settled charge.
        payment_intent: PaymentIntentId,
    },

    /// The charge is in flight; the balance is credited when the provider
    /// confirms it.
    Pending {
        /// The in-flight charge.
        payment_intent: PaymentIntentId,
    },

    /// The charge failed; the user can complete the top-up through the
    /// recovery URL.
    Failed {
        /// Raw decline code, if the network sent one.
        decline_code: Option<String>,
        /// Checkout URL for completing the top-up with a new card.
        recovery_url: Option<String>,
    },
}

/// Why an automatic attempt was skipped without charging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No automatic top-up is configured for this key.
    NotConfigured,

    /// The balance is at or above the configured threshold.
    BalanceAboveThreshold,

    /// A soft failure's cooldown is still running.
    WaitingForRetryCooldown {
        /// When the next attempt becomes eligible.
        next_attempt_at: DateTime<Utc>,
    },

    /// Attempts are blocked until the payment method changes.
    BlockedUntilCardUpdated,

    /// No payment method is on file; the failure record is untouched.
    NoPaymentMethod,

    /// The UTC calendar-month attempt cap has been reached.
    MonthlyLimitReached,
}

/// How a failed automatic attempt left the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoTopUpFailure {
    /// Soft decline below the strike limit; a retry is scheduled.
    WillRetry {
        /// When the next attempt becomes eligible.
        next_attempt_at: DateTime<Utc>,
        /// Raw decline code, if any.
        decline_code: Option<String>,
    },

    /// Hard decline, or the third consecutive soft decline; the user must
    /// update their card.
    ActionRequired {
        /// Raw decline code, if any.
        decline_code: Option<String>,
    },
}

/// Outcome of an automatic top-up check.
#[derive(Debug, Clone)]
pub enum AutoTopUpOutcome {
    /// A charge was made and the balance credited.
    Triggered {
        /// Units credited.
        amount: i64,
        /// Balance after the credit, when the ledger write succeeded.
        new_balance: Option<i64>,
        /// The settled charge.
        payment_intent: PaymentIntentId,
    },

    /// A charge was made and is awaiting provider confirmation.
    Pending {
        /// The in-flight charge.
        payment_intent: PaymentIntentId,
    },

    /// No charge was attempted.
    Skipped(SkipReason),

    /// The charge was declined.
    Failed(AutoTopUpFailure),
}

/// Orchestrates top-up attempts and owns the failure tracker.
pub struct TopUpService {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerService>,
    charges: Arc<dyn ChargeGateway>,
    customers: Arc<dyn CustomerDirectory>,
    config: Arc<BillingConfig>,
    events: EventSink,
}

impl TopUpService {
    /// Create a new top-up service.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerService>,
        charges: Arc<dyn ChargeGateway>,
        customers: Arc<dyn CustomerDirectory>,
        config: Arc<BillingConfig>,
        events: EventSink,
    ) -> Self {
        Self {
            store,
            ledger,
            charges,
            customers,
            config,
            events,
        }
    }

    /// User-initiated top-up of `amount` units.
    ///
    /// Not gated by the failure tracker: the user explicitly asked. On
    /// failure the caller gets a recovery URL instead of a scheduled retry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a non-positive amount.
    /// - [`LedgerError::WalletNotConfigured`] /
    ///   [`LedgerError::TrackingNotEnabled`] for an unpriceable key.
    /// - [`LedgerError::UserNotFound`] when no customer profile exists.
    /// - [`LedgerError::Gateway`] for provider failures that are not
    ///   declines.
    pub async fn top_up(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Result<TopUpOutcome> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let charge_cents = self.config.charge_amount_cents(key, amount)?;
        let currency = self.config.charge_currency(key);
        let profile = self.profile(user_id).await?;

        let Some(payment_method) = profile.default_payment_method.clone() else {
            // No card on file: hand back a checkout URL so the user can
            // finish the purchase in one step.
            let recovery_url = self
                .charges
                .recovery_url(&profile.customer_id, charge_cents, &currency)
                .await?;
            return Ok(TopUpOutcome::Failed {
                decline_code: None,
                recovery_url: Some(recovery_url),
            });
        };

        let idempotency = idempotency_key
            .unwrap_or_else(|| format!("topup:{user_id}:{key}:{}", ulid_suffix()));
        let outcome = self
            .charges
            .charge(
                &profile.customer_id,
                charge_cents,
                &currency,
                &payment_method,
                &idempotency,
            )
            .await?;

        match outcome {
            ChargeOutcome::Succeeded { payment_intent } => {
                let new_balance = self
                    .credit_after_charge(
                        user_id,
                        key,
                        amount,
                        &payment_intent,
                        TransactionSource::TopUp,
                    )
                    .await;
                // A successful manual charge proves the card works again.
                self.store.clear_failures(user_id, key).await.map_err(LedgerError::from)?;
                self.events.top_up_completed(TopUpCompleted {
                    user_id: *user_id,
                    key: key.clone(),
                    amount,
                    balance: new_balance,
                    payment_intent: payment_intent.clone(),
                    automatic: false,
                });
                Ok(TopUpOutcome::Succeeded {
                    new_balance,
                    payment_intent,
                })
            }
            ChargeOutcome::Processing { payment_intent } => {
                tracing::info!(
                    user_id = %user_id,
                    key = %key,
                    payment_intent = %payment_intent,
                    "Top-up charge processing; awaiting provider confirmation"
                );
                Ok(TopUpOutcome::Pending { payment_intent })
            }
            ChargeOutcome::Failed { decline_code, .. } => {
                let recovery_url = self
                    .charges
                    .recovery_url(&profile.customer_id, charge_cents, &currency)
                    .await
                    .map_err(|err| {
                        tracing::warn!(error = %err, "Failed to mint recovery URL");
                        err
                    })
                    .ok();
                tracing::info!(
                    user_id = %user_id,
                    key = %key,
                    decline_code = ?decline_code,
                    "Top-up charge declined"
                );
                Ok(TopUpOutcome::Failed {
                    decline_code,
                    recovery_url,
                })
            }
        }
    }

    /// Check whether an automatic top-up is due for the pair and, if so,
    /// attempt one. Invoked after every successful `consume`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UserNotFound`] when no customer profile exists.
    /// - [`LedgerError::Gateway`] for provider failures that are not
    ///   declines. Declines themselves are absorbed into the returned
    ///   outcome and the failure tracker.
    pub async fn trigger_auto_top_up_if_needed(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        current_balance: i64,
    ) -> Result<AutoTopUpOutcome> {
        let Some(cfg) = self.config.auto_top_up(key) else {
            return Ok(AutoTopUpOutcome::Skipped(SkipReason::NotConfigured));
        };

        let failure = self.store.failure(user_id, key).await.map_err(LedgerError::from)?;
        if let Some(record) = &failure {
            if record.is_blocked() {
                tracing::debug!(
                    user_id = %user_id,
                    key = %key,
                    failure_count = %record.failure_count,
                    decline_type = %record.decline_type,
                    "Auto top-up blocked until card is updated"
                );
                return Ok(AutoTopUpOutcome::Skipped(SkipReason::BlockedUntilCardUpdated));
            }
        }

        if current_balance >= cfg.threshold {
            return Ok(AutoTopUpOutcome::Skipped(SkipReason::BalanceAboveThreshold));
        }

        if let Some(record) = &failure {
            let now = Utc::now();
            if record.in_cooldown(now) {
                return Ok(AutoTopUpOutcome::Skipped(SkipReason::WaitingForRetryCooldown {
                    next_attempt_at: record.cooldown_until(),
                }));
            }
        }

        let profile = self.profile(user_id).await?;
        let Some(payment_method) = profile.default_payment_method.clone() else {
            return Ok(AutoTopUpOutcome::Skipped(SkipReason::NoPaymentMethod));
        };

        let month_start = utc_month_start(Utc::now());
        let month_count = self
            .store
            .count_auto_top_ups_since(user_id, key, month_start)
            .await
            .map_err(LedgerError::from)?;
        if month_count >= cfg.monthly_cap {
            tracing::info!(
                user_id = %user_id,
                key = %key,
                month_count = %month_count,
                cap = %cfg.monthly_cap,
                "Auto top-up skipped: monthly limit reached"
            );
            return Ok(AutoTopUpOutcome::Skipped(SkipReason::MonthlyLimitReached));
        }

        // Deterministic per persisted state: a redelivered trigger derives
        // the same key and cannot double-charge.
        let ordinal = month_count + failure.as_ref().map_or(0, |f| f.failure_count);
        let idempotency = format!(
            "auto-topup:{user_id}:{key}:{}:{ordinal}:{}",
            month_start.format("%Y-%m"),
            payment_method.last8()
        );

        let amount = cfg.amount;
        let charge_cents = self.config.charge_amount_cents(key, amount)?;
        let currency = self.config.charge_currency(key);

        let outcome = self
            .charges
            .charge(
                &profile.customer_id,
                charge_cents,
                &currency,
                &payment_method,
                &idempotency,
            )
            .await?;

        match outcome {
            ChargeOutcome::Succeeded { payment_intent } => {
                let new_balance = self
                    .credit_after_charge(
                        user_id,
                        key,
                        amount,
                        &payment_intent,
                        TransactionSource::AutoTopUp,
                    )
                    .await;
                self.store.clear_failures(user_id, key).await.map_err(LedgerError::from)?;
                tracing::info!(
                    user_id = %user_id,
                    key = %key,
                    amount = %amount,
                    payment_intent = %payment_intent,
                    "Auto top-up succeeded"
                );
                self.events.top_up_completed(TopUpCompleted {
                    user_id: *user_id,
                    key: key.clone(),
                    amount,
                    balance: new_balance,
                    payment_intent: payment_intent.clone(),
                    automatic: true,
                });
                Ok(AutoTopUpOutcome::Triggered {
                    amount,
                    new_balance,
                    payment_intent,
                })
            }
            ChargeOutcome::Processing { payment_intent } => {
                tracing::info!(
                    user_id = %user_id,
                    key = %key,
                    payment_intent = %payment_intent,
                    "Auto top-up charge processing; awaiting provider confirmation"
                );
                Ok(AutoTopUpOutcome::Pending { payment_intent })
            }
            ChargeOutcome::Failed { decline_code, .. } => {
                self.absorb_auto_failure(user_id, key, &payment_method, decline_code)
                    .await
            }
        }
    }

    /// Webhook-confirmed payment: credit the ledger and clear the failure
    /// record. The credit is idempotent on the payment intent, so a charge
    /// already credited inline is not applied twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn on_payment_succeeded(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        payment_intent: &PaymentIntentId,
        automatic: bool,
    ) -> Result<()> {
        let source = if automatic {
            TransactionSource::AutoTopUp
        } else {
            TransactionSource::TopUp
        };
        let new_balance = self
            .credit_after_charge(user_id, key, amount, payment_intent, source)
            .await;
        self.store.clear_failures(user_id, key).await.map_err(LedgerError::from)?;
        if let Some(balance) = new_balance {
            self.events.top_up_completed(TopUpCompleted {
                user_id: *user_id,
                key: key.clone(),
                amount,
                balance: Some(balance),
                payment_intent: payment_intent.clone(),
                automatic,
            });
        }
        Ok(())
    }

    /// Payment-method change detected: clear every failure record for the
    /// user so automatic attempts resume with the new card.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn on_payment_method_updated(&self, user_id: &UserId) -> Result<()> {
        self.store
            .clear_all_failures(user_id)
            .await
            .map_err(LedgerError::from)?;
        tracing::info!(user_id = %user_id, "Payment method updated; top-up failures cleared");
        Ok(())
    }

    /// Clear the failure record for one pair, re-enabling automatic
    /// attempts (operator override).
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn unblock(&self, user_id: &UserId, key: &BalanceKey) -> Result<()> {
        self.store
            .clear_failures(user_id, key)
            .await
            .map_err(LedgerError::from)?;
        tracing::info!(user_id = %user_id, key = %key, "Top-up failure record cleared");
        Ok(())
    }

    /// Failure tracker state for a pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn failure_status(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
    ) -> Result<Option<tally_core::TopUpFailure>> {
        self.store.failure(user_id, key).await.map_err(LedgerError::from)
    }

    async fn profile(&self, user_id: &UserId) -> Result<CustomerProfile> {
        self.customers
            .profile(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Credit the ledger for a settled charge. The charge already happened,
    /// so a persistence failure here is a reconciliation warning, not an
    /// operation failure: the ledger can be repaired from the provider's own
    /// record.
    async fn credit_after_charge(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        payment_intent: &PaymentIntentId,
        source: TransactionSource,
    ) -> Option<i64> {
        let meta = OperationMeta {
            source,
            source_id: Some(payment_intent.to_string()),
            idempotency_key: Some(format!("pi:{payment_intent}")),
            description: Some(match source {
                TransactionSource::AutoTopUp => "Automatic top-up".to_string(),
                _ => "Top-up purchase".to_string(),
            }),
        };
        match self.ledger.grant(user_id, key, amount, meta).await {
            Ok(tx) => Some(tx.balance_after),
            Err(LedgerError::IdempotencyConflict { .. }) => {
                // Already credited (inline and webhook paths race benignly).
                tracing::debug!(
                    user_id = %user_id,
                    key = %key,
                    payment_intent = %payment_intent,
                    "Charge already credited"
                );
                match self.ledger.get_balance(user_id, key).await {
                    Ok(record) => Some(record.balance),
                    Err(_) => None,
                }
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    key = %key,
                    payment_intent = %payment_intent,
                    error = %err,
                    "Charge succeeded but ledger credit failed; reconcile from provider records"
                );
                None
            }
        }
    }

    async fn absorb_auto_failure(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        payment_method: &tally_core::PaymentMethodId,
        decline_code: Option<String>,
    ) -> Result<AutoTopUpOutcome> {
        let decline_type = classify_decline(decline_code.as_deref());
        let record = self
            .store
            .record_failure(
                user_id,
                key,
                Some(payment_method),
                decline_type,
                decline_code.as_deref(),
            )
            .await
            .map_err(LedgerError::from)?;

        let blocked = decline_type == DeclineType::Hard
            || record.failure_count >= MAX_CONSECUTIVE_FAILURES;
        let failure = if blocked {
            AutoTopUpFailure::ActionRequired {
                decline_code: decline_code.clone(),
            }
        } else {
            AutoTopUpFailure::WillRetry {
                next_attempt_at: record.cooldown_until(),
                decline_code: decline_code.clone(),
            }
        };

        tracing::warn!(
            user_id = %user_id,
            key = %key,
            decline_type = %decline_type,
            decline_code = ?decline_code,
            failure_count = %record.failure_count,
            blocked = %blocked,
            "Auto top-up charge declined"
        );
        self.events.auto_top_up_failed(AutoTopUpFailed {
            user_id: *user_id,
            key: key.clone(),
            decline_type,
            decline_code,
            failure_count: record.failure_count,
            next_attempt_at: (!blocked).then(|| record.cooldown_until()),
            blocked,
        });

        Ok(AutoTopUpOutcome::Failed(failure))
    }
}

/// Start of the current UTC calendar month.
///
/// Attempt counting is pinned to UTC so multi-region deployments agree on
/// month boundaries.
fn utc_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now
        .date_naive()
        .with_day(1)
        .expect("first of month is valid");
    DateTime::from_naive_utc_and_offset(
        first.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        Utc,
    )
}

fn ulid_suffix() -> String {
    tally_core::TransactionId::generate().to_string()
}
