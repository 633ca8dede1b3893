//! Billing Domain Model
//!
//! Accounts hold the purchased points balance, subscriptions hold the daily
//! allowance, and payment transactions log one-off point purchases.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BillingError;

/// A billable identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Identity id issued by the sign-in provider
    pub id: String,

    pub email: Option<String>,

    pub display_name: Option<String>,

    /// Purchased points, never negative
    pub points_balance: i64,

    /// Sticky once true
    pub has_purchased: bool,

    /// Gateway customer id, set at most once
    pub payment_customer_ref: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to provision an account
#[derive(Clone, Debug, Default)]
pub struct NewAccount {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl NewAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Subscription lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// Map the gateway's status vocabulary. Statuses without a local
    /// counterpart (trialing, incomplete, ...) return `None`.
    pub fn from_gateway(status: &str) -> Option<Self> {
        match status {
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(BillingError::Storage(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A billing period
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One row per subscription lifecycle, never physically deleted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,

    /// Gateway subscription id, unique
    pub external_subscription_ref: String,

    pub payment_customer_ref: Option<String>,
    pub daily_points_limit: i64,
    pub daily_points_used: i64,
    pub last_usage_reset_date: NaiveDate,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a first activation
#[derive(Clone, Debug)]
pub struct NewSubscription {
    pub account_id: String,
    pub plan_id: String,
    pub external_subscription_ref: String,
    pub payment_customer_ref: Option<String>,
    pub daily_points_limit: i64,
    pub period: BillingPeriod,
    pub today: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle fields the reconciler may change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub period: Option<BillingPeriod>,
    pub cancel_at_period_end: Option<bool>,
}

/// Result of an atomic daily usage increment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub daily_points_used: i64,

    /// The stored usage belonged to an earlier day and was replaced
    pub was_reset: bool,
}

/// Payment transaction states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BillingError::Storage(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

/// One row per checkout attempt for a points package
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub account_id: String,

    /// Gateway checkout session id, the idempotency key
    pub external_session_ref: String,

    pub package_id: String,
    pub points_purchased: i64,

    /// Smallest currency unit
    pub amount_paid: i64,

    pub currency: String,
    pub status: TransactionStatus,

    /// Gateway payment reference, known once completed
    pub payment_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub account_id: String,
    pub external_session_ref: String,
    pub package_id: String,
    pub points_purchased: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// A consumption or payment that could not be booked automatically
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingException {
    pub id: Uuid,
    pub account_id: String,
    pub capability_id: Option<String>,
    pub cost: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewBillingException {
    pub account_id: String,
    pub capability_id: Option<String>,
    pub cost: i64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status_mapping() {
        assert_eq!(SubscriptionStatus::from_gateway("past_due"), Some(SubscriptionStatus::PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("trialing"), None);
        assert_eq!(SubscriptionStatus::from_gateway("incomplete_expired"), None);
    }

    #[test]
    fn test_status_round_trip_through_storage_text() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TransactionStatus>().is_err());
    }
}
