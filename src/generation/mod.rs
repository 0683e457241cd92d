//! Text generation capability used by workers.
//!
//! A `Generator` turns a prompt into a result string. Workers wrap every
//! call in their own timeout, so implementations need not enforce one.

pub mod llm;
pub mod mock;

use async_trait::async_trait;

use crate::error::GenerationError;

pub use llm::{LlmGenerator, LlmSettings};
pub use mock::{FixedGenerator, MockGenerator};

/// Produces text for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generates a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
