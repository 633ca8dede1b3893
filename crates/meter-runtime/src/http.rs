//! HTTP Generation Backend
//!
//! Posts the request as JSON to `GENERATION_URL` and expects
//! `{ "output": ..., "tokensIn": n, "tokensOut": n }` back.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use crate::capability::{Generation, GenerationCapability, GenerationRequest};
use crate::error::{CapabilityError, Result};

#[derive(Clone, Debug)]
pub struct HttpCapabilityConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HttpCapabilityConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/generate".into(),
            api_key: None,
            timeout_secs: 300,
        }
    }
}

impl HttpCapabilityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("GENERATION_URL").unwrap_or(defaults.url),
            api_key: std::env::var("GENERATION_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout_secs: std::env::var("GENERATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
        }
    }
}

pub struct HttpCapability {
    client: reqwest::Client,
    config: HttpCapabilityConfig,
}

impl HttpCapability {
    pub fn from_config(config: HttpCapabilityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CapabilityError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(HttpCapabilityConfig::from_env())
    }
}

/// Map a non-success status onto the error taxonomy
fn status_error(status: StatusCode, body: &str) -> CapabilityError {
    let message = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::Unavailable(message)
    } else {
        CapabilityError::Request(message)
    }
}

#[async_trait]
impl GenerationCapability for HttpCapability {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let mut call = self.client.post(&self.config.url).json(request);
        if let Some(key) = &self.config.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::warn!(
                capability_id = %request.capability_id,
                status = %status,
                "Generation backend returned an error"
            );
            return Err(status_error(status, &body));
        }

        let generation: Generation = serde_json::from_str(&body)?;
        tracing::debug!(
            capability_id = %request.capability_id,
            tokens_in = generation.tokens_in,
            tokens_out = generation.tokens_out,
            "Generation completed"
        );
        Ok(generation)
    }

    async fn health_check(&self) -> bool {
        match self.client.head(&self.config.url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::warn!("Generation health check failed: {}", e);
                false
            }
        }
    }

    fn name(&self) -> &str {
        "HTTP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "bad prompt"),
            CapabilityError::Request(msg) if msg.contains("bad prompt")
        ));
    }

    #[test]
    fn test_response_shape() {
        let generation: Generation = serde_json::from_str(
            r#"{"output":{"frames":[]},"tokensIn":1200,"tokensOut":340}"#,
        )
        .unwrap();
        assert_eq!(generation.tokens_in, 1200);
        assert_eq!(generation.tokens_out, 340);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let capability = HttpCapability::from_config(HttpCapabilityConfig {
            url: "http://127.0.0.1:9/generate".into(),
            api_key: None,
            timeout_secs: 2,
        })
        .unwrap();

        let err = capability
            .generate(&GenerationRequest::new("gpt-5.2", "a login screen"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!capability.health_check().await);
    }
}
