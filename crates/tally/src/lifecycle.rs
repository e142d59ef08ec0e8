//! Subscription lifecycle reconciliation.
//!
//! Translates subscription events (created, renewed, plan-changed,
//! cancelled) into ledger operations. Webhook deliveries are at-least-once,
//! so every grant/revoke derives an idempotency key from the triggering
//! object; a redelivered event replays into conflicts and mutates nothing.
//!
//! # Upgrade / downgrade rules
//!
//! A price-amount increase applies immediately: coming from a paid plan the
//! old balance is preserved and the new allocation granted on top; coming
//! from a free plan the old balance is revoked first (it has no monetary
//! value). A price-amount decrease is deferred: the subscription is marked
//! with pending-downgrade metadata and balances stay untouched until the
//! next renewal, which prevents consuming a full allocation and immediately
//! downgrading to re-trigger a fresh one.

use std::sync::Arc;

use tally_core::{
    BalanceKey, InvoiceId, LedgerError, PriceId, Result, SubscriptionSnapshot, TransactionSource,
    UserId, PENDING_DOWNGRADE_KEY, PREVIOUS_PRICE_KEY,
};

use crate::config::{BillingConfig, PlanConfig, RenewalPolicy};
use crate::gateway::SubscriptionGateway;
use crate::ledger::{LedgerService, OperationMeta};

/// Applies subscription lifecycle transitions to balances.
pub struct LifecycleService {
    ledger: Arc<LedgerService>,
    subscriptions: Arc<dyn SubscriptionGateway>,
    config: Arc<BillingConfig>,
}

impl LifecycleService {
    /// Create a new lifecycle service.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        subscriptions: Arc<dyn SubscriptionGateway>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            config,
        }
    }

    /// A subscription started: grant the plan's allocations, scaled to its
    /// billing interval.
    ///
    /// Safety net: if the customer somehow holds several active
    /// subscriptions, only the highest-value one survives; the rest are
    /// cancelled and their grants suppressed so the customer is not
    /// double-credited.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway or store operation fails.
    pub async fn on_subscription_created(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
    ) -> Result<()> {
        if !subscription.status.is_active() {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = ?subscription.status,
                "Ignoring created event for inactive subscription"
            );
            return Ok(());
        }

        if self.resolve_duplicates(subscription).await? {
            // This subscription lost the duplicate resolution; no credits.
            return Ok(());
        }

        let Some(plan) = self.config.plan(&subscription.price_id) else {
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = %subscription.price_id,
                "Subscription price not in plan catalog; no credits granted"
            );
            return Ok(());
        };

        for allocation in &plan.allocations {
            let amount = plan.interval.scale_allocation(allocation.monthly_amount);
            if amount == 0 {
                continue;
            }
            let meta = OperationMeta {
                source: TransactionSource::Subscription,
                source_id: Some(subscription.id.to_string()),
                idempotency_key: Some(format!(
                    "sub-created:{}:{}:{}",
                    subscription.id,
                    allocation.key,
                    subscription.current_period_start.timestamp()
                )),
                description: Some("Subscription credit grant".to_string()),
            };
            benign(
                self.ledger
                    .grant(user_id, &allocation.key, amount, meta)
                    .await
                    .map(|_| ()),
            )?;
        }
        Ok(())
    }

    /// A billing-cycle invoice was paid: apply each key's renewal policy.
    ///
    /// If a downgrade is pending, the downgrade target becomes the effective
    /// plan and the marker is cleared; the renewal then behaves like a
    /// normal renewal of the target plan.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway or store operation fails.
    pub async fn on_subscription_renewed(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        invoice_id: &InvoiceId,
    ) -> Result<()> {
        let effective_price = if let Some(target) = subscription.pending_downgrade() {
            tracing::info!(
                subscription_id = %subscription.id,
                target_price = %target,
                "Applying pending downgrade at renewal"
            );
            self.clear_downgrade_marker(subscription).await?;
            target
        } else {
            subscription.price_id.clone()
        };

        let Some(plan) = self.config.plan(&effective_price) else {
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = %effective_price,
                "Renewed price not in plan catalog; balances untouched"
            );
            return Ok(());
        };

        for allocation in &plan.allocations {
            let amount = plan.interval.scale_allocation(allocation.monthly_amount);
            let meta = OperationMeta {
                source: TransactionSource::Renewal,
                source_id: Some(invoice_id.to_string()),
                idempotency_key: Some(format!("renewal:{invoice_id}:{}", allocation.key)),
                description: Some("Renewal credit allocation".to_string()),
            };
            self.apply_renewal_policy(user_id, &allocation.key, amount, meta)
                .await?;
        }
        Ok(())
    }

    /// The subscription's price changed.
    ///
    /// Amount increases (including interval lengthening) apply immediately;
    /// amount decreases are deferred behind a pending-downgrade marker. When
    /// a change arrives while a downgrade is already pending, the new change
    /// supersedes it: the comparison runs against the plan whose credits the
    /// user actually holds (the stored previous price), and the marker is
    /// rewritten or cleared accordingly.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway or store operation fails.
    pub async fn on_subscription_plan_changed(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        previous_price: &PriceId,
    ) -> Result<()> {
        let Some(new_plan) = self.config.plan(&subscription.price_id) else {
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = %subscription.price_id,
                "Changed-to price not in plan catalog; balances untouched"
            );
            return Ok(());
        };

        let had_pending = subscription.pending_downgrade().is_some();
        let effective_previous = if had_pending {
            subscription
                .previous_price()
                .unwrap_or_else(|| previous_price.clone())
        } else {
            previous_price.clone()
        };
        let old_amount = self
            .config
            .plan(&effective_previous)
            .map_or(0, |p| p.amount_cents);

        if new_plan.amount_cents >= old_amount {
            if had_pending {
                // The upgrade supersedes the queued downgrade.
                self.clear_downgrade_marker(subscription).await?;
            }
            self.apply_upgrade(user_id, subscription, new_plan, &effective_previous, old_amount)
                .await
        } else {
            self.defer_downgrade(subscription, &effective_previous).await
        }
    }

    /// The provider applied a scheduled downgrade (price now matches the
    /// pending target): clear the marker and apply the target plan's
    /// renewal policy.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway or store operation fails.
    pub async fn on_downgrade_applied(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        current_price: &PriceId,
    ) -> Result<()> {
        match subscription.pending_downgrade() {
            None => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    "No pending downgrade; nothing to apply"
                );
                return Ok(());
            }
            Some(target) if target != *current_price => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    pending = %target,
                    current = %current_price,
                    "Pending downgrade target does not match current price; leaving marker"
                );
                return Ok(());
            }
            Some(_) => {}
        }

        self.clear_downgrade_marker(subscription).await?;

        let Some(plan) = self.config.plan(current_price) else {
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = %current_price,
                "Downgrade target not in plan catalog; balances untouched"
            );
            return Ok(());
        };

        for allocation in &plan.allocations {
            let amount = plan.interval.scale_allocation(allocation.monthly_amount);
            let meta = OperationMeta {
                source: TransactionSource::PlanChange,
                source_id: Some(subscription.id.to_string()),
                idempotency_key: Some(format!(
                    "downgrade-applied:{}:{current_price}:{}",
                    subscription.id, allocation.key
                )),
                description: Some("Downgrade allocation".to_string()),
            };
            self.apply_renewal_policy(user_id, &allocation.key, amount, meta)
                .await?;
        }
        Ok(())
    }

    /// The subscription was cancelled: revoke every configured balance
    /// immediately, regardless of renewal policy.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails.
    pub async fn on_subscription_cancelled(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
    ) -> Result<()> {
        for key in self.config.configured_keys() {
            let meta = OperationMeta {
                source: TransactionSource::Cancellation,
                source_id: Some(subscription.id.to_string()),
                idempotency_key: Some(format!("cancel:{}:{key}", subscription.id)),
                description: Some("Subscription cancelled".to_string()),
            };
            benign(
                self.ledger
                    .revoke_all(user_id, &key, meta)
                    .await
                    .map(|_| ()),
            )?;
        }
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Balances revoked for cancelled subscription"
        );
        Ok(())
    }

    /// Returns true when `subscription` is a duplicate that was cancelled
    /// and must not be credited.
    async fn resolve_duplicates(&self, subscription: &SubscriptionSnapshot) -> Result<bool> {
        let active = self
            .subscriptions
            .active_subscriptions(&subscription.customer_id)
            .await?;
        let others: Vec<&SubscriptionSnapshot> =
            active.iter().filter(|s| s.id != subscription.id).collect();
        if others.is_empty() {
            return Ok(false);
        }

        let value = |price: &PriceId| self.config.plan(price).map_or(0, |p| p.amount_cents);
        let own_value = value(&subscription.price_id);

        if others.iter().any(|s| value(&s.price_id) > own_value) {
            tracing::warn!(
                customer_id = %subscription.customer_id,
                subscription_id = %subscription.id,
                "Duplicate subscription is lower-value; cancelling it and suppressing credits"
            );
            if let Err(err) = self.subscriptions.cancel(&subscription.id).await {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    error = %err,
                    "Failed to cancel duplicate subscription"
                );
            }
            return Ok(true);
        }

        for other in others {
            tracing::warn!(
                customer_id = %subscription.customer_id,
                subscription_id = %other.id,
                "Cancelling lower-value duplicate subscription"
            );
            if let Err(err) = self.subscriptions.cancel(&other.id).await {
                tracing::warn!(
                    subscription_id = %other.id,
                    error = %err,
                    "Failed to cancel duplicate subscription"
                );
            }
        }
        Ok(false)
    }

    async fn apply_upgrade(
        &self,
        user_id: &UserId,
        subscription: &SubscriptionSnapshot,
        new_plan: &PlanConfig,
        previous_price: &PriceId,
        old_amount: i64,
    ) -> Result<()> {
        for allocation in &new_plan.allocations {
            let amount = new_plan.interval.scale_allocation(allocation.monthly_amount);

            if old_amount == 0 {
                // Free-plan credits carry no monetary value; clear them
                // before granting the paid allocation.
                let meta = OperationMeta {
                    source: TransactionSource::PlanChange,
                    source_id: Some(subscription.id.to_string()),
                    idempotency_key: Some(format!(
                        "plan-change-revoke:{}:{}:{}",
                        subscription.id, subscription.price_id, allocation.key
                    )),
                    description: Some("Free-plan balance cleared on upgrade".to_string()),
                };
                benign(
                    self.ledger
                        .revoke_all(user_id, &allocation.key, meta)
                        .await
                        .map(|_| ()),
                )?;
            }

            if amount == 0 {
                continue;
            }
            let meta = OperationMeta {
                source: TransactionSource::PlanChange,
                source_id: Some(subscription.id.to_string()),
                idempotency_key: Some(format!(
                    "plan-change:{}:{previous_price}:{}:{}",
                    subscription.id, subscription.price_id, allocation.key
                )),
                description: Some("Upgrade credit grant".to_string()),
            };
            benign(
                self.ledger
                    .grant(user_id, &allocation.key, amount, meta)
                    .await
                    .map(|_| ()),
            )?;
        }
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            previous_price = %previous_price,
            new_price = %subscription.price_id,
            "Upgrade applied"
        );
        Ok(())
    }

    async fn defer_downgrade(
        &self,
        subscription: &SubscriptionSnapshot,
        previous_price: &PriceId,
    ) -> Result<()> {
        self.subscriptions
            .update_metadata(
                &subscription.id,
                &[
                    (
                        PENDING_DOWNGRADE_KEY.to_string(),
                        subscription.price_id.to_string(),
                    ),
                    (PREVIOUS_PRICE_KEY.to_string(), previous_price.to_string()),
                ],
            )
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            target_price = %subscription.price_id,
            previous_price = %previous_price,
            "Downgrade deferred to next renewal"
        );
        Ok(())
    }

    async fn clear_downgrade_marker(&self, subscription: &SubscriptionSnapshot) -> Result<()> {
        self.subscriptions
            .update_metadata(
                &subscription.id,
                &[
                    (PENDING_DOWNGRADE_KEY.to_string(), String::new()),
                    (PREVIOUS_PRICE_KEY.to_string(), String::new()),
                ],
            )
            .await
    }

    async fn apply_renewal_policy(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        amount: i64,
        meta: OperationMeta,
    ) -> Result<()> {
        match self.config.renewal_policy(key) {
            RenewalPolicy::Reset => benign(
                self.ledger
                    .set_balance(user_id, key, amount, meta)
                    .await
                    .map(|_| ()),
            ),
            RenewalPolicy::Add => {
                if amount == 0 {
                    return Ok(());
                }
                benign(
                    self.ledger
                        .grant(user_id, key, amount, meta)
                        .await
                        .map(|_| ()),
                )
            }
        }
    }
}

/// Webhook redeliveries replay into idempotency conflicts; those are the
/// dedup mechanism working, not failures.
fn benign(result: Result<()>) -> Result<()> {
    match result {
        Err(LedgerError::IdempotencyConflict { key }) => {
            tracing::debug!(idempotency_key = %key, "Duplicate delivery ignored");
            Ok(())
        }
        other => other,
    }
}
