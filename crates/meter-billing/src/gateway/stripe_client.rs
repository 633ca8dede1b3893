//! Stripe Checkout Integration
//!
//! Hosted checkout for points packages and subscription plans. Subscriptions
//! are read back over the REST API directly so per-item billing periods from
//! newer API versions are available.

use async_trait::async_trait;
use chrono::Duration;
use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCustomer,
    Customer, CustomerId, Subscription, SubscriptionId, UpdateSubscription,
};

use super::{CheckoutMode, CheckoutRequest, HostedCheckout, PaymentGateway};
use crate::error::{BillingError, Result};
use crate::model::Account;
use crate::webhook::{DEFAULT_TOLERANCE_SECS, SignatureVerifier, SubscriptionObject};

const API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe credentials and redirect targets
#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,

    /// Accepted age of a signed webhook timestamp
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Create from environment variables. `None` when payments are not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(secret_key) = std::env::var("STRIPE_SECRET_KEY") else {
            return Ok(None);
        };
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;
        let success_url = std::env::var("STRIPE_SUCCESS_URL")
            .map_err(|_| BillingError::Config("STRIPE_SUCCESS_URL not set".into()))?;
        let cancel_url = std::env::var("STRIPE_CANCEL_URL")
            .map_err(|_| BillingError::Config("STRIPE_CANCEL_URL not set".into()))?;
        let webhook_tolerance_secs =
            parse_tolerance(std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS").ok().as_deref())?;

        Ok(Some(Self {
            secret_key,
            webhook_secret,
            success_url,
            cancel_url,
            webhook_tolerance_secs,
        }))
    }
}

fn parse_tolerance(raw: Option<&str>) -> Result<i64> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_TOLERANCE_SECS);
    };
    match raw.trim().parse::<i64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(BillingError::Config(format!(
            "STRIPE_WEBHOOK_TOLERANCE_SECS must be a positive number of seconds, got {raw:?}"
        ))),
    }
}

pub struct StripeGateway {
    client: Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Verifier for this account's webhook endpoint
    pub fn signature_verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(self.config.webhook_secret.clone())
            .with_tolerance(Duration::seconds(self.config.webhook_tolerance_secs))
    }
}

fn stripe_error(err: stripe::StripeError) -> BillingError {
    BillingError::Gateway(err.to_string())
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, account: &Account) -> Result<String> {
        let mut params = CreateCustomer::new();
        params.email = account.email.as_deref();
        params.name = account.display_name.as_deref();
        params.metadata = Some(
            [("account_id".to_string(), account.id.clone())]
                .into_iter()
                .collect(),
        );

        let customer = Customer::create(&self.client, params)
            .await
            .map_err(stripe_error)?;

        tracing::info!(account_id = %account.id, customer_ref = %customer.id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<HostedCheckout> {
        let customer: CustomerId = request
            .customer_ref
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid customer id: {}", request.customer_ref)))?;

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer);
        params.success_url = Some(&self.config.success_url);
        params.cancel_url = Some(&self.config.cancel_url);
        params.metadata = Some(request.metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_ref.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        match request.mode {
            CheckoutMode::Payment => {
                params.mode = Some(CheckoutSessionMode::Payment);
            }
            CheckoutMode::Subscription => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(request.metadata.clone()),
                    ..Default::default()
                });
            }
        }

        let session = CheckoutSession::create(&self.client, params)
            .await
            .map_err(stripe_error)?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Gateway("No checkout URL returned".into()))?;

        Ok(HostedCheckout {
            session_ref: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<SubscriptionObject> {
        let response = self
            .http
            .get(format!("{API_BASE}/subscriptions/{subscription_ref}"))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<SubscriptionObject>().await?)
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<()> {
        let id: SubscriptionId = subscription_ref
            .parse()
            .map_err(|_| BillingError::Gateway(format!("invalid subscription id: {subscription_ref}")))?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        Subscription::update(&self.client, &id, params)
            .await
            .map_err(stripe_error)?;

        tracing::info!(subscription_ref = %subscription_ref, "Scheduled cancellation at period end");
        Ok(())
    }

    fn name(&self) -> &str {
        "Stripe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(webhook_tolerance_secs: i64) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_1".into(),
            webhook_secret: "whsec_test".into(),
            success_url: "https://app.invalid/success".into(),
            cancel_url: "https://app.invalid/cancel".into(),
            webhook_tolerance_secs,
        }
    }

    #[test]
    fn test_tolerance_defaults_and_validates() {
        assert_eq!(parse_tolerance(None).unwrap(), DEFAULT_TOLERANCE_SECS);
        assert_eq!(parse_tolerance(Some(" 600 ")).unwrap(), 600);
        assert!(matches!(parse_tolerance(Some("0")), Err(BillingError::Config(_))));
        assert!(matches!(parse_tolerance(Some("soon")), Err(BillingError::Config(_))));
    }

    #[test]
    fn test_verifier_uses_configured_tolerance() {
        let gateway = StripeGateway::new(config(30));
        assert_eq!(gateway.name(), "Stripe");

        let verifier = gateway.signature_verifier();
        let now = Utc::now();
        let fresh = verifier.sign(b"body", now.timestamp() - 20).unwrap();
        let stale = verifier.sign(b"body", now.timestamp() - 60).unwrap();

        assert!(verifier.verify(b"body", &fresh, now).is_ok());
        assert!(matches!(
            verifier.verify(b"body", &stale, now),
            Err(BillingError::InvalidSignature(_))
        ));
    }
}
