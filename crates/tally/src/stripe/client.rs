//! Stripe API client implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;

use tally_core::{
    CustomerId, LedgerError, PaymentIntentId, PaymentMethodId, SubscriptionId,
    SubscriptionSnapshot, SubscriptionStatus,
};

use super::types::{
    CheckoutSessionObject, CustomerObject, PaymentIntentObject, StripeErrorResponse, StripeList,
    SubscriptionObject,
};
use crate::gateway::{ChargeGateway, ChargeOutcome, SubscriptionGateway};

/// Error type for Stripe operations.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe API returned an error.
    #[error("Stripe API error: {error_type} - {message}")]
    Api {
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },

    /// A response field could not be interpreted.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<StripeError> for LedgerError {
    fn from(err: StripeError) -> Self {
        Self::Gateway(err.to_string())
    }
}

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    api_key: String,
    base_url: String,
    return_url: String,
}

impl StripeClient {
    /// Stripe API base URL.
    const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    /// * `return_url` - URL users land on after a recovery checkout
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, return_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key: api_key.into(),
            base_url: Self::BASE_URL.to_string(),
            return_url: return_url.into(),
        }
    }

    /// Point the client at a different base URL (test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<StripeErrorResponse, _> = response.json().await;
        match error_body {
            Ok(stripe_error) => Err(StripeError::Api {
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message.unwrap_or_default(),
                code: stripe_error.error.code,
            }),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }

    fn outcome_from_intent(intent: PaymentIntentObject) -> Result<ChargeOutcome, StripeError> {
        let payment_intent: PaymentIntentId = intent
            .id
            .parse()
            .map_err(|_| StripeError::UnexpectedResponse("empty payment intent id".into()))?;
        match intent.status.as_str() {
            "succeeded" => Ok(ChargeOutcome::Succeeded { payment_intent }),
            "processing" => Ok(ChargeOutcome::Processing { payment_intent }),
            _ => {
                let decline_code = intent
                    .last_payment_error
                    .and_then(|e| e.decline_code.or(e.code));
                Ok(ChargeOutcome::Failed {
                    payment_intent: Some(payment_intent),
                    decline_code,
                })
            }
        }
    }

    fn snapshot_from_subscription(
        sub: SubscriptionObject,
    ) -> Result<SubscriptionSnapshot, StripeError> {
        let price = sub
            .items
            .data
            .first()
            .map(|item| item.price.id.clone())
            .ok_or_else(|| {
                StripeError::UnexpectedResponse(format!("subscription {} has no items", sub.id))
            })?;

        let status = match sub.status.as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Incomplete,
        };

        let period = |secs: i64| {
            DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                StripeError::UnexpectedResponse(format!("invalid period timestamp {secs}"))
            })
        };

        Ok(SubscriptionSnapshot {
            id: sub
                .id
                .parse()
                .map_err(|_| StripeError::UnexpectedResponse("empty subscription id".into()))?,
            customer_id: sub
                .customer
                .parse()
                .map_err(|_| StripeError::UnexpectedResponse("empty customer id".into()))?,
            status,
            price_id: price
                .parse()
                .map_err(|_| StripeError::UnexpectedResponse("empty price id".into()))?,
            current_period_start: period(sub.current_period_start)?,
            current_period_end: period(sub.current_period_end)?,
            cancel_at_period_end: sub.cancel_at_period_end,
            metadata: sub.metadata,
        })
    }
}

#[async_trait]
impl ChargeGateway for StripeClient {
    async fn charge(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        currency: &str,
        payment_method: &PaymentMethodId,
        idempotency_key: &str,
    ) -> tally_core::Result<ChargeOutcome> {
        let params = [
            ("amount", amount_cents.to_string()),
            ("currency", currency.to_string()),
            ("customer", customer.to_string()),
            ("payment_method", payment_method.to_string()),
            ("confirm", "true".to_string()),
            ("off_session", "true".to_string()),
        ];

        tracing::debug!(
            customer = %customer,
            amount_cents = %amount_cents,
            currency = %currency,
            "Creating off-session payment intent"
        );

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(StripeError::Http)?;

        let status = response.status();
        if status.is_success() {
            let intent: PaymentIntentObject =
                response.json().await.map_err(StripeError::Http)?;
            return Ok(Self::outcome_from_intent(intent)?);
        }

        // A declined confirm comes back as a card_error envelope with the
        // intent embedded; that's a charge outcome, not a client failure.
        let error_body: Result<StripeErrorResponse, _> = response.json().await;
        match error_body {
            Ok(body) if body.error.error_type == "card_error" => {
                let payment_intent = body
                    .error
                    .payment_intent
                    .and_then(|pi| pi.id.parse().ok());
                Ok(ChargeOutcome::Failed {
                    payment_intent,
                    decline_code: body.error.decline_code.or(body.error.code),
                })
            }
            Ok(body) => Err(StripeError::Api {
                error_type: body.error.error_type,
                message: body.error.message.unwrap_or_default(),
                code: body.error.code,
            }
            .into()),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }
            .into()),
        }
    }

    async fn recovery_url(
        &self,
        customer: &CustomerId,
        amount_cents: i64,
        currency: &str,
    ) -> tally_core::Result<String> {
        let params = [
            ("mode", "payment".to_string()),
            ("customer", customer.to_string()),
            ("success_url", self.return_url.clone()),
            ("cancel_url", self.return_url.clone()),
            ("line_items[0][price_data][currency]", currency.to_string()),
            (
                "line_items[0][price_data][product_data][name]",
                "Balance top-up".to_string(),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                amount_cents.to_string(),
            ),
            ("line_items[0][quantity]", "1".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await
            .map_err(StripeError::Http)?;

        let session: CheckoutSessionObject = Self::handle_response(response).await?;
        session.url.ok_or_else(|| {
            StripeError::UnexpectedResponse(format!("checkout session {} has no URL", session.id))
                .into()
        })
    }

    async fn default_payment_method(
        &self,
        customer: &CustomerId,
    ) -> tally_core::Result<Option<PaymentMethodId>> {
        let response = self
            .client
            .get(format!("{}/customers/{}", self.base_url, customer))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(StripeError::Http)?;

        let customer: CustomerObject = Self::handle_response(response).await?;
        Ok(customer
            .invoice_settings
            .and_then(|s| s.default_payment_method)
            .and_then(|pm| pm.parse().ok()))
    }
}

#[async_trait]
impl SubscriptionGateway for StripeClient {
    async fn subscription(
        &self,
        id: &SubscriptionId,
    ) -> tally_core::Result<Option<SubscriptionSnapshot>> {
        let response = self
            .client
            .get(format!("{}/subscriptions/{}", self.base_url, id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(StripeError::Http)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let sub: SubscriptionObject = Self::handle_response(response).await?;
        Ok(Some(Self::snapshot_from_subscription(sub)?))
    }

    async fn active_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> tally_core::Result<Vec<SubscriptionSnapshot>> {
        let response = self
            .client
            .get(format!("{}/subscriptions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .query(&[("customer", customer.as_str()), ("status", "active")])
            .send()
            .await
            .map_err(StripeError::Http)?;

        let list: StripeList<SubscriptionObject> = Self::handle_response(response).await?;
        list.data
            .into_iter()
            .map(|sub| Self::snapshot_from_subscription(sub).map_err(LedgerError::from))
            .collect()
    }

    async fn update_metadata(
        &self,
        id: &SubscriptionId,
        entries: &[(String, String)],
    ) -> tally_core::Result<()> {
        // Stripe deletes a metadata key when its value is set to "".
        let params: BTreeMap<String, &str> = entries
            .iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v.as_str()))
            .collect();

        let response = self
            .client
            .post(format!("{}/subscriptions/{}", self.base_url, id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await
            .map_err(StripeError::Http)?;

        let _: SubscriptionObject = Self::handle_response(response).await?;
        Ok(())
    }

    async fn cancel(&self, id: &SubscriptionId) -> tally_core::Result<()> {
        let response = self
            .client
            .delete(format!("{}/subscriptions/{}", self.base_url, id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(StripeError::Http)?;

        let _: SubscriptionObject = Self::handle_response(response).await?;
        Ok(())
    }
}
