//! Mock LLM service for testing
//!
//! Scripts are consumed one per `stream()` call, in the order queued.

use super::{LlmError, LlmRequest, LlmService, TokenStream};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted action inside a mock stream
#[derive(Debug)]
pub enum MockStep {
    Fragment(String),
    Fail(LlmError),
    Delay(Duration),
}

impl MockStep {
    pub fn fragment(text: impl Into<String>) -> Self {
        MockStep::Fragment(text.into())
    }

    pub fn fail(error: LlmError) -> Self {
        MockStep::Fail(error)
    }

    pub fn delay(millis: u64) -> Self {
        MockStep::Delay(Duration::from_millis(millis))
    }
}

type Script = Result<Vec<MockStep>, LlmError>;

/// Mock LLM service that replays queued scripts
pub struct MockLlmService {
    scripts: Mutex<VecDeque<Script>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
    open_streams: Arc<AtomicUsize>,
}

impl MockLlmService {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a stream made of the given steps
    pub fn queue_script(&self, steps: Vec<MockStep>) {
        self.scripts.lock().unwrap().push_back(Ok(steps));
    }

    /// Queue a stream that emits these fragments then ends cleanly
    pub fn queue_fragments<I, S>(&self, fragments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_script(fragments.into_iter().map(MockStep::fragment).collect());
    }

    /// Queue a call that fails before any stream exists
    pub fn queue_open_error(&self, error: LlmError) {
        self.scripts.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Streams handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

struct OpenStreamGuard(Arc<AtomicUsize>);

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))?;

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = OpenStreamGuard(Arc::clone(&self.open_streams));

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    MockStep::Fragment(text) => yield Ok(text),
                    MockStep::Fail(error) => {
                        yield Err(error);
                        return;
                    }
                    MockStep::Delay(duration) => tokio::time::sleep(duration).await,
                }
            }
        }))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
