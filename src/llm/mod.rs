//! LLM integration.
//!
//! A single OpenAI-compatible chat-completions backend, wrapped in a
//! [`RetryingProvider`] so callers never see a bare rate-limit error.
//! Every caller in the crate goes through the [`LlmProvider`] trait, which
//! keeps tests free of network access.

pub mod openai;
pub mod provider;
pub mod retry;

pub use openai::OpenAiCompatProvider;
pub use provider::*;
pub use retry::{RetryPolicy, RetryingProvider};

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    /// Base URL up to and including the version segment, e.g. `https://api.together.xyz/v1`.
    pub base_url: String,
    pub model: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// Create the retry-wrapped provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let inner = OpenAiCompatProvider::new(config)?;
    tracing::info!(
        model = %config.model,
        base_url = %config.base_url,
        max_attempts = config.retry.max_attempts,
        "Using OpenAI-compatible LLM endpoint"
    );
    Ok(Arc::new(RetryingProvider::new(
        Arc::new(inner),
        config.retry.clone(),
    )))
}

/// Pull a JSON object out of model output that may be wrapped in a
/// markdown code fence or surrounded by prose.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
