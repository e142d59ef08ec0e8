//! Stripe client tests against a mock HTTP server.

use serde_json::json;
use wiremock::matchers::{body_string_contains, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tally::gateway::{ChargeGateway, ChargeOutcome, SubscriptionGateway};
use tally::stripe::StripeClient;
use tally_core::{LedgerError, SubscriptionStatus};

fn client(server: &MockServer) -> StripeClient {
    StripeClient::new("sk_test_xxx", "https://app.test/billing").with_base_url(server.uri())
}

#[tokio::test]
async fn charge_success_maps_to_succeeded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .and(header_exists("idempotency-key"))
        .and(body_string_contains("confirm=true"))
        .and(body_string_contains("off_session=true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "status": "succeeded"
        })))
        .mount(&server)
        .await;

    let outcome = client(&server)
        .charge(
            &"cus_1".parse().unwrap(),
            500,
            "usd",
            &"pm_1".parse().unwrap(),
            "auto-topup:test:0",
        )
        .await
        .unwrap();

    match outcome {
        ChargeOutcome::Succeeded { payment_intent } => {
            assert_eq!(payment_intent.as_str(), "pi_123");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn charge_processing_maps_to_processing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "status": "processing"
        })))
        .mount(&server)
        .await;

    let outcome = client(&server)
        .charge(
            &"cus_1".parse().unwrap(),
            500,
            "usd",
            &"pm_1".parse().unwrap(),
            "k",
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ChargeOutcome::Processing { .. }));
}

#[tokio::test]
async fn card_error_maps_to_failed_with_decline_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {
                "type": "card_error",
                "code": "card_declined",
                "decline_code": "insufficient_funds",
                "message": "Your card has insufficient funds.",
                "payment_intent": { "id": "pi_failed", "status": "requires_payment_method" }
            }
        })))
        .mount(&server)
        .await;

    let outcome = client(&server)
        .charge(
            &"cus_1".parse().unwrap(),
            500,
            "usd",
            &"pm_1".parse().unwrap(),
            "k",
        )
        .await
        .unwrap();

    match outcome {
        ChargeOutcome::Failed {
            payment_intent,
            decline_code,
        } => {
            assert_eq!(payment_intent.unwrap().as_str(), "pi_failed");
            assert_eq!(decline_code.as_deref(), Some("insufficient_funds"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn non_card_error_surfaces_as_gateway_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "message": "Invalid API key provided."
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .charge(
            &"cus_1".parse().unwrap(),
            500,
            "usd",
            &"pm_1".parse().unwrap(),
            "k",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Gateway(_)));
}

#[tokio::test]
async fn recovery_url_creates_checkout_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .and(body_string_contains("mode=payment"))
        .and(body_string_contains("customer=cus_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_123",
            "url": "https://checkout.stripe.com/c/pay/cs_123"
        })))
        .mount(&server)
        .await;

    let url = client(&server)
        .recovery_url(&"cus_1".parse().unwrap(), 500, "usd")
        .await
        .unwrap();
    assert_eq!(url, "https://checkout.stripe.com/c/pay/cs_123");
}

#[tokio::test]
async fn default_payment_method_reads_invoice_settings() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customers/cus_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_1",
            "invoice_settings": { "default_payment_method": "pm_42" }
        })))
        .mount(&server)
        .await;

    let pm = client(&server)
        .default_payment_method(&"cus_1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(pm.unwrap().as_str(), "pm_42");
}

#[tokio::test]
async fn subscription_fetch_builds_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions/sub_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": { "data": [ { "price": { "id": "price_pro" } } ] },
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "cancel_at_period_end": true,
            "metadata": {}
        })))
        .mount(&server)
        .await;

    let snapshot = client(&server)
        .subscription(&"sub_1".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.customer_id.as_str(), "cus_1");
    assert_eq!(snapshot.price_id.as_str(), "price_pro");
    assert_eq!(snapshot.status, SubscriptionStatus::Active);
    assert!(snapshot.cancel_at_period_end);
}

#[tokio::test]
async fn missing_subscription_reads_as_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions/sub_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "type": "invalid_request_error", "message": "No such subscription" }
        })))
        .mount(&server)
        .await;

    let snapshot = client(&server)
        .subscription(&"sub_missing".parse().unwrap())
        .await
        .unwrap();
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn active_subscriptions_queries_by_customer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions"))
        .and(query_param("customer", "cus_1"))
        .and(query_param("status", "active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                    "items": { "data": [ { "price": { "id": "price_basic" } } ] },
                    "current_period_start": 1_700_000_000,
                    "current_period_end": 1_702_592_000
                }
            ]
        })))
        .mount(&server)
        .await;

    let subs = client(&server)
        .active_subscriptions(&"cus_1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].price_id.as_str(), "price_basic");
}

#[tokio::test]
async fn update_metadata_posts_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/subscriptions/sub_1"))
        .and(body_string_contains("tally_pending_downgrade"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": { "data": [ { "price": { "id": "price_basic" } } ] },
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000
        })))
        .mount(&server)
        .await;

    client(&server)
        .update_metadata(
            &"sub_1".parse().unwrap(),
            &[("tally_pending_downgrade".to_string(), "price_basic".to_string())],
        )
        .await
        .unwrap();
}
