//! LLM provider abstraction
//!
//! The generation engine is an opaque capability: given an ordered message
//! list, produce a lazy stream of text fragments.

mod config;
mod error;
mod gemini;
mod types;

#[cfg(test)]
pub mod testing;

pub use config::LlmConfig;
pub use error::{LlmError, LlmErrorKind};
pub use gemini::GeminiService;
pub use types::*;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Lazy sequence of text deltas produced by a provider
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Start a streaming completion.
    ///
    /// An `Err` here means the call never got going (bad key, HTTP error);
    /// errors inside the stream mean it was interrupted.
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let start = Instant::now();
        let mut upstream = match self.inner.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %start.elapsed().as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM stream failed to start"
                );
                return Err(e);
            }
        };

        tracing::debug!(
            model = %self.model_id,
            messages = request.messages.len(),
            "LLM stream opened"
        );

        let model_id = self.model_id.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut fragments = 0usize;
            let mut bytes = 0usize;
            while let Some(item) = upstream.next().await {
                match &item {
                    Ok(text) => {
                        fragments += 1;
                        bytes += text.len();
                    }
                    Err(e) => {
                        tracing::error!(
                            model = %model_id,
                            duration_ms = %start.elapsed().as_millis(),
                            fragments,
                            error = %e.message,
                            retryable = e.kind.is_retryable(),
                            "LLM stream interrupted"
                        );
                    }
                }
                yield item;
            }
            tracing::info!(
                model = %model_id,
                duration_ms = %start.elapsed().as_millis(),
                fragments,
                bytes,
                "LLM stream completed"
            );
        }))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
