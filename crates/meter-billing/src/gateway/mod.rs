//! Payment Gateway Port
//!
//! Outbound calls to the hosted payment provider. Inbound events arrive
//! through [`crate::webhook`].

mod mock;
mod stripe_client;

pub use mock::MockPaymentGateway;
pub use stripe_client::{StripeConfig, StripeGateway};

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::model::Account;
use crate::webhook::SubscriptionObject;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutMode {
    /// One-off points purchase
    Payment,

    /// Recurring plan
    Subscription,
}

/// A hosted checkout to open for a customer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub mode: CheckoutMode,
    pub customer_ref: String,
    pub price_ref: String,

    /// Echoed back in webhook events. In subscription mode it is attached to
    /// the created subscription as well.
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedCheckout {
    pub session_ref: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a customer record for the account, returning its reference
    async fn create_customer(&self, account: &Account) -> Result<String>;

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<HostedCheckout>;

    /// Canonical subscription state, used to refresh periods on renewal
    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<SubscriptionObject>;

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<()>;

    fn name(&self) -> &str;
}
