//! Billing Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, BillingError>;

/// Why a paid action was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentRequiredReason {
    /// An active subscription exists but today's allowance is used up
    DailyQuotaExhausted,

    /// The account never purchased points or a plan
    NoPurchase,

    /// The account purchased before but the balance is too low
    InsufficientPoints,
}

impl PaymentRequiredReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::DailyQuotaExhausted => {
                "Daily subscription limit reached. Purchase points or wait until tomorrow."
            }
            Self::NoPurchase => "Purchase points or subscribe to a plan to use this model.",
            Self::InsufficientPoints => "Not enough points. Purchase more points to continue.",
        }
    }
}

/// Billing-related errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// Conditional deduction refused, balance untouched
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: i64, available: i64 },

    /// Caller must pay before proceeding
    #[error("Payment required: {}", .0.message())]
    PaymentRequired(PaymentRequiredReason),

    #[error("Unauthenticated")]
    Unauthenticated,

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    InvalidSignature(String),

    /// Webhook payload could not be interpreted
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("An active subscription already exists")]
    SubscriptionAlreadyActive,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Payment gateway API error
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::Storage(_))
    }

    /// Whether the caller should be sent to a purchase flow
    pub fn is_payment_required(&self) -> bool {
        matches!(
            self,
            Self::PaymentRequired(_) | Self::InsufficientBalance { .. }
        )
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            Self::PaymentRequired(reason) => reason.message(),
            Self::InsufficientBalance { .. } => PaymentRequiredReason::InsufficientPoints.message(),
            Self::Unauthenticated => "Please sign in again.",
            Self::InvalidSignature(_) | Self::MalformedEvent(_) => "Invalid webhook payload.",
            Self::SubscriptionNotFound(_) => "No active subscription found.",
            Self::TransactionNotFound(_) => "Payment session not found.",
            Self::AccountNotFound(_) => "Account not found.",
            Self::UnknownCapability(_) => "Unknown model.",
            Self::UnknownPlan(_) => "Invalid subscription plan.",
            Self::UnknownPackage(_) => "Invalid points package.",
            Self::SubscriptionAlreadyActive => {
                "You already have an active subscription. Cancel it first before subscribing to a new plan."
            }
            Self::Forbidden(_) => "You are not allowed to access this resource.",
            Self::Gateway(_) => "Payment processing failed. Please try again.",
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        Self::Gateway(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_required_messages_are_distinct() {
        let quota = BillingError::PaymentRequired(PaymentRequiredReason::DailyQuotaExhausted);
        let none = BillingError::PaymentRequired(PaymentRequiredReason::NoPurchase);
        assert_ne!(quota.user_message(), none.user_message());
        assert!(quota.is_payment_required());
    }

    #[test]
    fn test_insufficient_balance_counts_as_payment_required() {
        let err = BillingError::InsufficientBalance { needed: 150, available: 100 };
        assert!(err.is_payment_required());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Insufficient balance: need 150, have 100");
    }
}
