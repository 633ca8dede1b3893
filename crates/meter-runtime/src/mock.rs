//! Mock Generation Backend
//!
//! For testing and demo purposes. Returns a fixed output and unit counts.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::capability::{Generation, GenerationCapability, GenerationRequest};
use crate::error::{CapabilityError, Result};

pub struct MockCapability {
    tokens_in: u64,
    tokens_out: u64,
    fail: bool,
    calls: AtomicUsize,
}

impl Default for MockCapability {
    fn default() -> Self {
        Self::new(1_000, 500)
    }
}

impl MockCapability {
    pub fn new(tokens_in: u64, tokens_out: u64) -> Self {
        Self {
            tokens_in,
            tokens_out,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails as unavailable
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationCapability for MockCapability {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CapabilityError::Unavailable("mock backend down".into()));
        }

        Ok(Generation {
            output: serde_json::json!({
                "capabilityId": request.capability_id,
                "echo": request.prompt,
            }),
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        })
    }

    async fn health_check(&self) -> bool {
        !self.fail
    }

    fn name(&self) -> &str {
        "Mock"
    }
}
