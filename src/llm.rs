//! LLM provider abstraction
//!
//! Provides a common interface for the planner, synthesizer and observer
//! models, plus a wrapper applying the transient-failure retry policy.

mod anthropic;
mod error;
mod gemini;
mod types;

pub use anthropic::{AnthropicModel, AnthropicService};
pub use error::{LlmError, LlmErrorKind};
pub use gemini::{GeminiModel, GeminiService};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Transient failures are retried this many times beyond the first attempt.
const MAX_RETRIES: u32 = 2;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: LlmService + ?Sized> LlmService for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Retry-and-log wrapper applied to every production service.
///
/// Retries up to twice on retryable kinds (network, rate limit, 5xx) with a
/// short backoff, honoring server-provided `retry_after` hints.
pub struct RetryingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl RetryingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for RetryingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut attempt = 0;
        loop {
            let start = std::time::Instant::now();
            let result = self.inner.complete(request).await;
            let duration = start.elapsed();

            match result {
                Ok(response) => {
                    tracing::info!(
                        model = %self.model_id,
                        duration_ms = %duration.as_millis(),
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "LLM request completed"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    let retryable = e.kind.is_retryable() && attempt < MAX_RETRIES;
                    tracing::warn!(
                        model = %self.model_id,
                        duration_ms = %duration.as_millis(),
                        error = %e.message,
                        attempt,
                        retrying = retryable,
                        "LLM request failed"
                    );
                    if !retryable {
                        return Err(e);
                    }
                    let backoff = e
                        .retry_after
                        .unwrap_or_else(|| Duration::from_millis(500 * (1 << attempt)));
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
