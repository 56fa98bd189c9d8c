//! Generation backends.
//!
//! The dialogue core only knows the [`Generator`] trait; this module supplies
//! the concrete implementation used by the service: an OpenAI-compatible
//! chat-completions client wrapped in retry with exponential backoff.

mod openai;
mod resilient;

pub use openai::ChatCompletionsGenerator;
pub use resilient::{RetryConfig, RetryingGenerator};

use counsel_common::LlmConfig;
use counsel_dialogue::Generator;
use std::sync::Arc;
use thiserror::Error;

/// Error from a generation backend.
#[derive(Debug, Clone, Error)]
#[error("[{provider}:{model}] {message}")]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    /// Whether another attempt could succeed.
    ///
    /// Transport failures, timeouts, rate limits, and server errors are
    /// retryable; other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self.status_code {
            None => true,
            Some(code) => code == 408 || code == 429 || code >= 500,
        }
    }
}

/// Build the generator described by `config`.
pub fn build_generator(config: &LlmConfig) -> anyhow::Result<Arc<dyn Generator>> {
    if config.api_key.is_none() {
        tracing::warn!(
            base_url = %config.base_url,
            "No LLM API key configured; requests will be sent unauthenticated"
        );
    }

    let client = ChatCompletionsGenerator::new(config)?;
    let retrying = RetryingGenerator::new(Arc::new(client), RetryConfig::from(config));
    Ok(Arc::new(retrying))
}
