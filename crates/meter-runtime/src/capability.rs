//! Generation Capability Strategy Pattern
//!
//! The generation engine is opaque to billing: a request goes in, an output
//! and the consumed unit counts come out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A generation call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Catalog id of the model to run
    pub capability_id: String,

    pub prompt: String,

    /// Current design document or selection, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(capability_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            prompt: prompt.into(),
            context: None,
            max_output_tokens: None,
        }
    }
}

/// Output plus the units billing charges for
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub output: serde_json::Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Generation backend trait
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    fn name(&self) -> &str;
}
