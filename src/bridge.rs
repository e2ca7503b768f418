//! Generation bridge
//!
//! Turns a transcript snapshot into a lazy, fused sequence of non-empty text
//! fragments, bounded by a per-fragment timeout and an overall deadline. The
//! concatenation of everything it yielded is kept so the relay can commit
//! exactly what the client saw.

use crate::llm::{LlmError, LlmRequest, LlmService, TokenStream};
use crate::transcript::Turn;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// One non-empty text delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(String);

impl Fragment {
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        (!text.is_empty()).then_some(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Generation could not start, was interrupted, or ran out of time
#[derive(Debug, Error)]
#[error("generation failed after {} bytes: {reason}", .partial.len())]
pub struct GenerationFailure {
    pub reason: LlmError,
    /// Text already yielded before the failure
    pub partial: String,
}

/// Limits applied to every generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeLimits {
    pub fragment_timeout: Duration,
    pub stream_timeout: Duration,
}

impl Default for BridgeLimits {
    fn default() -> Self {
        Self {
            fragment_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(300),
        }
    }
}

/// Mediates between the transcript and the generation capability
#[derive(Clone)]
pub struct Bridge {
    llm: Arc<dyn LlmService>,
    limits: BridgeLimits,
}

impl Bridge {
    pub fn new(llm: Arc<dyn LlmService>, limits: BridgeLimits) -> Self {
        Self { llm, limits }
    }

    /// Prepare a generation over `snapshot`. Nothing is sent upstream until
    /// the first call to [`Generation::next`]; the overall deadline starts now.
    pub fn open(&self, snapshot: &[Turn]) -> Generation {
        Generation {
            llm: Arc::clone(&self.llm),
            request: Some(LlmRequest::from_turns(snapshot)),
            stream: None,
            accumulated: String::new(),
            fragments: 0,
            deadline: Instant::now() + self.limits.stream_timeout,
            limits: self.limits,
            finished: false,
        }
    }
}

/// A single in-flight generation
pub struct Generation {
    llm: Arc<dyn LlmService>,
    request: Option<LlmRequest>,
    stream: Option<TokenStream>,
    accumulated: String,
    fragments: usize,
    deadline: Instant,
    limits: BridgeLimits,
    finished: bool,
}

impl Generation {
    /// Next fragment, `None` at the clean end, or the failure.
    ///
    /// After `None` or a failure every further call returns `None`.
    pub async fn next(&mut self) -> Option<Result<Fragment, GenerationFailure>> {
        if self.finished {
            return None;
        }

        match self.advance().await {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => {
                self.release();
                None
            }
            Err(reason) => {
                self.release();
                Some(Err(GenerationFailure {
                    reason,
                    partial: self.accumulated.clone(),
                }))
            }
        }
    }

    /// Everything yielded so far, in order
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn into_text(self) -> String {
        self.accumulated
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    async fn advance(&mut self) -> Result<Option<Fragment>, LlmError> {
        if self.stream.is_none() {
            let Some(request) = self.request.take() else {
                return Ok(None);
            };
            let wait = self.wait_budget();
            let opened = tokio::time::timeout(wait, self.llm.stream(&request))
                .await
                .map_err(|_| self.timeout_error())??;
            self.stream = Some(opened);
        }

        loop {
            let wait = self.wait_budget();
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            let item = tokio::time::timeout(wait, stream.next())
                .await
                .map_err(|_| self.timeout_error())?;

            match item {
                None => return Ok(None),
                Some(Err(e)) => return Err(e),
                Some(Ok(text)) => {
                    let Some(fragment) = Fragment::new(text) else {
                        continue;
                    };
                    self.accumulated.push_str(fragment.as_str());
                    self.fragments += 1;
                    return Ok(Some(fragment));
                }
            }
        }
    }

    fn wait_budget(&self) -> Duration {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        remaining.min(self.limits.fragment_timeout)
    }

    fn timeout_error(&self) -> LlmError {
        if Instant::now() >= self.deadline {
            LlmError::timeout(format!(
                "Stream exceeded {}s",
                self.limits.stream_timeout.as_secs()
            ))
        } else {
            LlmError::timeout(format!(
                "No fragment within {}s",
                self.limits.fragment_timeout.as_secs()
            ))
        }
    }

    /// Drop the upstream stream so its connection is closed
    fn release(&mut self) {
        self.stream = None;
        self.request = None;
        self.finished = true;
    }
}
