//! Subscription lifecycle reconciliation: grants, renewals, plan changes,
//! cancellation, and the duplicate-subscription safety net.

mod common;

use common::{key, price, snapshot, TestHarness};
use tally::OperationMeta;
use tally_core::{
    BalanceKey, SubscriptionStatus, TransactionSource, PENDING_DOWNGRADE_KEY, PREVIOUS_PRICE_KEY,
};

fn manual() -> OperationMeta {
    OperationMeta::from_source(TransactionSource::Manual)
}

// ============================================================================
// Subscription created
// ============================================================================

#[tokio::test]
async fn created_grants_monthly_allocation() {
    let harness = TestHarness::new();
    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness.subscriptions.insert(sub.clone());

    harness
        .billing
        .on_subscription_created(&harness.user_id, &sub)
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 1000);
}

#[tokio::test]
async fn created_scales_yearly_allocation_twelve_fold() {
    let harness = TestHarness::new();
    let sub = snapshot("sub_1", "cus_1", "price_pro_yearly");
    harness.subscriptions.insert(sub.clone());

    harness
        .billing
        .on_subscription_created(&harness.user_id, &sub)
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 12_000);
}

#[tokio::test]
async fn created_redelivery_grants_once() {
    let harness = TestHarness::new();
    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness.subscriptions.insert(sub.clone());

    harness
        .billing
        .on_subscription_created(&harness.user_id, &sub)
        .await
        .unwrap();
    harness
        .billing
        .on_subscription_created(&harness.user_id, &sub)
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 1000);
}

#[tokio::test]
async fn created_ignores_unknown_price_and_inactive_status() {
    let harness = TestHarness::new();

    let unknown = snapshot("sub_1", "cus_1", "price_mystery");
    harness.subscriptions.insert(unknown.clone());
    harness
        .billing
        .on_subscription_created(&harness.user_id, &unknown)
        .await
        .unwrap();

    let mut incomplete = snapshot("sub_2", "cus_1", "price_pro");
    incomplete.status = SubscriptionStatus::Incomplete;
    harness
        .billing
        .on_subscription_created(&harness.user_id, &incomplete)
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 0);
}

// ============================================================================
// Duplicate subscriptions
// ============================================================================

#[tokio::test]
async fn duplicate_lower_value_subscription_is_cancelled_without_credits() {
    let harness = TestHarness::new();
    let existing = snapshot("sub_pro", "cus_1", "price_pro");
    let duplicate = snapshot("sub_basic", "cus_1", "price_basic");
    harness.subscriptions.insert(existing);
    harness.subscriptions.insert(duplicate.clone());

    harness
        .billing
        .on_subscription_created(&harness.user_id, &duplicate)
        .await
        .unwrap();

    // The lower-value duplicate was cancelled and granted nothing.
    let cancelled = harness.subscriptions.cancelled_ids();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].as_str(), "sub_basic");

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 0);
}

#[tokio::test]
async fn higher_value_subscription_survives_and_cancels_the_rest() {
    let harness = TestHarness::new();
    let existing = snapshot("sub_basic", "cus_1", "price_basic");
    let winner = snapshot("sub_pro", "cus_1", "price_pro");
    harness.subscriptions.insert(existing);
    harness.subscriptions.insert(winner.clone());

    harness
        .billing
        .on_subscription_created(&harness.user_id, &winner)
        .await
        .unwrap();

    let cancelled = harness.subscriptions.cancelled_ids();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].as_str(), "sub_basic");

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &key("api_calls"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 1000);
}

// ============================================================================
// Renewal
// ============================================================================

#[tokio::test]
async fn renewal_reset_forgives_negative_wallet_debt() {
    let harness = TestHarness::new();
    let wallet = BalanceKey::wallet();

    harness
        .billing
        .grant(&harness.user_id, &wallet, 300, manual())
        .await
        .unwrap();
    harness
        .billing
        .consume(&harness.user_id, &wallet, 500, None, None)
        .await
        .unwrap();
    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &wallet)
            .await
            .unwrap()
            .balance,
        -200
    );

    let sub = snapshot("sub_w", "cus_1", "price_wallet");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_renewed(&harness.user_id, &sub, &"in_1".parse().unwrap())
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &wallet)
        .await
        .unwrap();
    assert_eq!(balance.balance, 500);
}

#[tokio::test]
async fn renewal_add_stacks_on_existing_balance() {
    let mut config = common::test_config();
    config.wallet.as_mut().unwrap().on_renewal = tally::RenewalPolicy::Add;
    let harness = TestHarness::with_config(config);
    let wallet = BalanceKey::wallet();

    harness
        .billing
        .grant(&harness.user_id, &wallet, 300, manual())
        .await
        .unwrap();
    harness
        .billing
        .consume(&harness.user_id, &wallet, 500, None, None)
        .await
        .unwrap();

    let sub = snapshot("sub_w", "cus_1", "price_wallet");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_renewed(&harness.user_id, &sub, &"in_1".parse().unwrap())
        .await
        .unwrap();

    // allocation + previous (possibly negative) balance.
    let balance = harness
        .billing
        .get_balance(&harness.user_id, &wallet)
        .await
        .unwrap();
    assert_eq!(balance.balance, 300);
}

#[tokio::test]
async fn renewal_redelivery_applies_once() {
    let harness = TestHarness::new();
    let sub = snapshot("sub_1", "cus_1", "price_basic");
    harness.subscriptions.insert(sub.clone());

    for _ in 0..2 {
        harness
            .billing
            .on_subscription_renewed(&harness.user_id, &sub, &"in_7".parse().unwrap())
            .await
            .unwrap();
    }

    let history = harness
        .billing
        .get_history(&harness.user_id, &key("api_calls"), 100, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &key("api_calls"))
            .await
            .unwrap()
            .balance,
        500
    );
}

// ============================================================================
// Plan changes: upgrades
// ============================================================================

#[tokio::test]
async fn paid_upgrade_preserves_balance_and_adds_allocation() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    // On price_basic with 340 credits left.
    harness
        .billing
        .grant(&harness.user_id, &api_calls, 340, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_basic"))
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &api_calls)
        .await
        .unwrap();
    assert_eq!(balance.balance, 1340);
}

#[tokio::test]
async fn free_to_paid_upgrade_revokes_before_granting() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    // 100 credits granted by the free plan.
    harness
        .billing
        .grant(&harness.user_id, &api_calls, 100, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_free"))
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &api_calls)
        .await
        .unwrap();
    assert_eq!(balance.balance, 1000);

    // The log shows the revoke then the grant.
    let mut history = harness
        .billing
        .get_history(&harness.user_id, &api_calls, 100, 0)
        .await
        .unwrap();
    history.reverse();
    assert_eq!(history[1].amount, -100);
    assert_eq!(history[2].amount, 1000);
}

#[tokio::test]
async fn interval_lengthening_is_an_immediate_upgrade() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 200, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_pro_yearly");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_pro"))
        .await
        .unwrap();

    let balance = harness
        .billing
        .get_balance(&harness.user_id, &api_calls)
        .await
        .unwrap();
    assert_eq!(balance.balance, 12_200);
}

// ============================================================================
// Plan changes: downgrades
// ============================================================================

#[tokio::test]
async fn downgrade_defers_until_renewal() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 900, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_basic");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_pro"))
        .await
        .unwrap();

    // Balances untouched at change time; the marker is on the subscription.
    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &api_calls)
            .await
            .unwrap()
            .balance,
        900
    );
    let stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    assert_eq!(
        stored.metadata.get(PENDING_DOWNGRADE_KEY).map(String::as_str),
        Some("price_basic")
    );
    assert_eq!(
        stored.metadata.get(PREVIOUS_PRICE_KEY).map(String::as_str),
        Some("price_pro")
    );

    // The next renewal applies the target plan's reset policy and clears
    // the marker.
    harness
        .billing
        .on_subscription_renewed(&harness.user_id, &stored, &"in_2".parse().unwrap())
        .await
        .unwrap();

    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &api_calls)
            .await
            .unwrap()
            .balance,
        500
    );
    let stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    assert!(!stored.metadata.contains_key(PENDING_DOWNGRADE_KEY));
}

#[tokio::test]
async fn upgrade_supersedes_pending_downgrade() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 900, manual())
        .await
        .unwrap();

    // pro -> basic: deferred.
    let sub = snapshot("sub_1", "cus_1", "price_basic");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_pro"))
        .await
        .unwrap();

    // Before renewal the user changes again, back up to pro. Compared
    // against the stored previous price (pro), this is a lateral move:
    // the pending downgrade is dropped and the pro allocation granted.
    let mut stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    stored.price_id = price("price_pro");
    harness.subscriptions.insert(stored.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &stored, &price("price_basic"))
        .await
        .unwrap();

    let stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    assert!(!stored.metadata.contains_key(PENDING_DOWNGRADE_KEY));
    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &api_calls)
            .await
            .unwrap()
            .balance,
        1900
    );
}

#[tokio::test]
async fn downgrade_applied_event_applies_target_policy() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 900, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_basic");
    harness.subscriptions.insert(sub.clone());
    harness
        .billing
        .on_subscription_plan_changed(&harness.user_id, &sub, &price("price_pro"))
        .await
        .unwrap();

    let stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    harness
        .billing
        .on_downgrade_applied(&harness.user_id, &stored, &price("price_basic"))
        .await
        .unwrap();

    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &api_calls)
            .await
            .unwrap()
            .balance,
        500
    );
    let stored = harness.subscriptions.get(&"sub_1".parse().unwrap()).unwrap();
    assert!(!stored.metadata.contains_key(PENDING_DOWNGRADE_KEY));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_revokes_every_configured_balance() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");
    let wallet = BalanceKey::wallet();

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 800, manual())
        .await
        .unwrap();
    harness
        .billing
        .grant(&harness.user_id, &wallet, 1500, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness
        .billing
        .on_subscription_cancelled(&harness.user_id, &sub)
        .await
        .unwrap();

    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &api_calls)
            .await
            .unwrap()
            .balance,
        0
    );
    assert_eq!(
        harness
            .billing
            .get_balance(&harness.user_id, &wallet)
            .await
            .unwrap()
            .balance,
        0
    );

    harness.settle().await;
    let revoked = harness.events.revoked.lock().unwrap();
    assert_eq!(revoked.len(), 2);
}

#[tokio::test]
async fn cancellation_redelivery_is_harmless() {
    let harness = TestHarness::new();
    let api_calls = key("api_calls");

    harness
        .billing
        .grant(&harness.user_id, &api_calls, 800, manual())
        .await
        .unwrap();

    let sub = snapshot("sub_1", "cus_1", "price_pro");
    harness
        .billing
        .on_subscription_cancelled(&harness.user_id, &sub)
        .await
        .unwrap();
    harness
        .billing
        .on_subscription_cancelled(&harness.user_id, &sub)
        .await
        .unwrap();

    let history = harness
        .billing
        .get_history(&harness.user_id, &api_calls, 100, 0)
        .await
        .unwrap();
    // One grant, one revoke; the redelivered cancellation was a no-op.
    assert_eq!(history.len(), 2);
}
