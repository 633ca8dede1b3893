//! Application State

use std::sync::Arc;

use chrono::Duration;
use meter_billing::{Billing, Clock, Payments};
use meter_runtime::GenerationCapability;

use crate::auth::IdentityVerifier;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Ledger, quota, admission and queries
    pub billing: Arc<Billing>,

    /// Checkout and webhook reconciliation (None if Stripe is not configured)
    pub payments: Option<Arc<Payments>>,

    /// Generation backend
    pub capability: Arc<dyn GenerationCapability>,

    pub identity: Arc<dyn IdentityVerifier>,

    pub clock: Arc<dyn Clock>,

    pub handoff_ttl: Duration,
}
