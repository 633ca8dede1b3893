//! # meter-billing
//!
//! Usage metering and payment reconciliation for the design plugin backend.
//!
//! ## Two Allowances
//!
//! Every paid capability call is charged against one of two allowances:
//!
//! - **Daily quota** from an active subscription, renewed each UTC day
//! - **Points** bought as one-off packages, never negative
//!
//! The daily quota always goes first. Points are only touched when the
//! remaining quota cannot cover the whole cost.
//!
//! ## Request Flow
//!
//! ```text
//! ┌──────────────┐   ensure_usable   ┌────────────┐   generate   ┌────────────┐
//! │   Request    │──────────────────▶│ Admission  │─────────────▶│ Capability │
//! └──────────────┘                   └────────────┘              └─────┬──────┘
//!                                          ▲                           │
//!                                          │ settle(tokens in/out)     │
//!                                          └───────────────────────────┘
//!                                quota first ─▶ points second ─▶ exception log
//! ```
//!
//! ## Payment Flow (Stripe Checkout, hosted)
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │  Checkout   │────▶│  Stripe Hosted  │────▶│ POST /webhook/stripe │
//! │  Service    │     │  Checkout Page  │     │  PaymentReconciler   │
//! └─────────────┘     └─────────────────┘     └──────────────────────┘
//! ```
//!
//! Webhook deliveries may repeat or arrive out of order. The reconciler
//! claims a pending transaction before crediting it, so a replayed
//! `checkout.session.completed` credits exactly once, and a late
//! `checkout.session.expired` never reverts a completed purchase.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meter_billing::{Billing, BillingConfig, MemoryStore, SystemClock};
//!
//! let billing = Billing::new(BillingConfig::from_env()?, Arc::new(MemoryStore::new()), Arc::new(SystemClock));
//!
//! billing.admission.ensure_usable(&account_id, "claude-opus-4.6").await?;
//! // ... run the capability ...
//! let summary = billing.admission.settle(&account_id, "claude-opus-4.6", 12_000, 3_400).await?;
//! ```

pub mod admission;
pub mod catalog;
pub mod checkout;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod queries;
pub mod quota;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod webhook;

pub use admission::{Admission, AdmissionController, SettlementSummary, SubscriptionUsage};
pub use catalog::{BillingConfig, Catalog, CapabilityPricing, PointsPackage, SubscriptionPlan};
pub use checkout::{Cancellation, CheckoutService, CheckoutSession};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{BillingError, PaymentRequiredReason, Result};
pub use gateway::{MockPaymentGateway, PaymentGateway, StripeConfig, StripeGateway};
pub use ledger::PointsLedger;
pub use model::{Account, NewAccount, PaymentTransaction, Subscription, SubscriptionStatus, TransactionStatus};
pub use queries::{BalanceView, BillingQueries, PaymentStatusView, SubscriptionStatusView, SubscriptionView};
pub use quota::QuotaTracker;
pub use reconcile::{PaymentReconciler, ReconcileOutcome};
pub use service::{Billing, Payments};
pub use store::{BillingStore, HandoffStore, MemoryStore};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use webhook::{EventEnvelope, GatewayEvent, SignatureVerifier};
