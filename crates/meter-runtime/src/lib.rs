//! # meter-runtime
//!
//! Generation backends for the design plugin.
//!
//! Billing only needs `generate(request) -> { output, tokensIn, tokensOut }`;
//! prompt assembly, model routing and response parsing live behind it.
//!
//! ## Backends
//!
//! - **HTTP** (default): JSON over HTTP to `GENERATION_URL`
//! - **Mock**: fixed unit counts for tests and demos
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meter_runtime::{GenerationCapability, GenerationRequest, HttpCapability};
//!
//! let backend = HttpCapability::from_env()?;
//! let generation = backend.generate(&GenerationRequest::new("gpt-5.2", "pricing page")).await?;
//! billing.admission.settle(&account_id, "gpt-5.2", generation.tokens_in, generation.tokens_out).await?;
//! ```

pub mod capability;
pub mod error;
pub mod http;
pub mod mock;

pub use capability::{Generation, GenerationCapability, GenerationRequest};
pub use error::{CapabilityError, Result};
pub use http::{HttpCapability, HttpCapabilityConfig};
pub use mock::MockCapability;
