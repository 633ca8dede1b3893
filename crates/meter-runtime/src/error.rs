//! Error Types

use thiserror::Error;

/// Result type alias for capability calls
pub type Result<T> = std::result::Result<T, CapabilityError>;

#[derive(Error, Debug)]
pub enum CapabilityError {
    /// Backend unreachable, overloaded or timed out
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the request
    #[error("Capability request failed: {0}")]
    Request(String),

    /// Response could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),
}

impl CapabilityError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "The generation service is currently unavailable. Please try again.",
            Self::Request(_) => "The generation service rejected the request.",
            Self::Parse(_) => "The generation service returned an unexpected response.",
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Unavailable(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CapabilityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
