//! Retry decorator for LLM providers.
//!
//! Rate-limited attempts back off linearly (`backoff * attempt`), other
//! request failures wait a flat `backoff`. Malformed responses and
//! authentication failures are returned immediately. No wait happens after
//! the final attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RateLimited,
    Transient,
    Fatal,
}

pub fn classify(error: &LlmError) -> RetryDecision {
    match error {
        LlmError::RateLimited { .. } => RetryDecision::RateLimited,
        LlmError::RequestFailed { .. } => RetryDecision::Transient,
        _ => RetryDecision::Fatal,
    }
}

impl RetryPolicy {
    /// Wait before the next attempt, given the attempt (1-based) that just failed.
    pub fn delay_for(&self, decision: RetryDecision, attempt: u32) -> Duration {
        match decision {
            RetryDecision::RateLimited => self.backoff.saturating_mul(attempt),
            RetryDecision::Transient => self.backoff,
            RetryDecision::Fatal => Duration::ZERO,
        }
    }
}

/// Wraps another provider and retries failed completions per [`RetryPolicy`].
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let decision = classify(&e);
                    if decision == RetryDecision::Fatal {
                        return Err(e);
                    }
                    last_reason = e.to_string();
                    if attempt < attempts {
                        let delay = self.policy.delay_for(decision, attempt);
                        tracing::warn!(
                            attempt,
                            attempts,
                            ?decision,
                            ?delay,
                            error = %e,
                            "LLM call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(attempts, reason = %last_reason, "LLM call gave up");
        Err(LlmError::RetriesExhausted {
            attempts,
            reason: last_reason,
        })
    }
}
