//! Streaming relay
//!
//! Runs one request cycle: validate, commit the user turn, open the chunked
//! response, forward every fragment as soon as it arrives, then commit the
//! assistant turn (success) or write an in-band error (failure).
//!
//! Once the response is open its status line is already sent, so a failure
//! can only be reported as text inside the body.

mod state;

#[cfg(test)]
mod proptests;

pub use state::{transition, Effect, FailureReason, RelayEvent, RelayState};

use crate::bridge::{Bridge, BridgeLimits, Generation};
use crate::config::{env_or, env_secs};
use crate::transcript::{Transcript, Turn, TurnGuard};
use futures::stream::Stream;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

/// Written in-band when generation fails after the response has started.
///
/// The body has no framing, so clients detect failure by this suffix alone;
/// a reply that genuinely ends with the same sentence reads as failed.
pub const STREAM_ERROR_MESSAGE: &str = "An error occurred during the conversation.";

/// Relay tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Max wait for another cycle to release the transcript
    pub queue_timeout: Duration,
    /// Max wait for a slow client to accept one fragment
    pub write_timeout: Duration,
    /// Fragments buffered between generation and the socket
    pub channel_capacity: usize,
    pub bridge: BridgeLimits,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            channel_capacity: 16,
            bridge: BridgeLimits::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_timeout: env_secs("QUEUE_TIMEOUT_SECS", defaults.queue_timeout.as_secs()),
            write_timeout: env_secs("WRITE_TIMEOUT_SECS", defaults.write_timeout.as_secs()),
            channel_capacity: env_or("RELAY_CHANNEL_CAPACITY", defaults.channel_capacity).max(1),
            bridge: BridgeLimits {
                fragment_timeout: env_secs(
                    "FRAGMENT_TIMEOUT_SECS",
                    defaults.bridge.fragment_timeout.as_secs(),
                ),
                stream_timeout: env_secs(
                    "STREAM_TIMEOUT_SECS",
                    defaults.bridge.stream_timeout.as_secs(),
                ),
            },
        }
    }
}

/// Errors reported before the response opens
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Message is required")]
    InvalidInput,
    #[error("Conversation is busy, try again shortly")]
    Busy,
}

/// Orchestrates request cycles against the shared transcript
pub struct Relay {
    transcript: Arc<Transcript>,
    bridge: Bridge,
    config: RelayConfig,
}

impl Relay {
    pub fn new(transcript: Arc<Transcript>, bridge: Bridge, config: RelayConfig) -> Self {
        Self {
            transcript,
            bridge,
            config,
        }
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    /// Validate and commit `message`, then start streaming the reply.
    ///
    /// Returns once the user turn is committed and generation is running in
    /// its own task; every error returned here happened before any output.
    pub async fn submit(&self, message: Option<String>) -> Result<RelayStream, RelayError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("relay", %request_id);
        let mut cycle = Cycle::new(Arc::clone(&self.transcript));

        let (guard, tx, rx) = async {
            let Some(text) = cycle.step(RelayEvent::Submit { message }).into_iter().find_map(
                |effect| match effect {
                    Effect::AppendUserTurn { text } => Some(text),
                    _ => None,
                },
            ) else {
                tracing::info!("Rejected empty message");
                return Err(RelayError::InvalidInput);
            };

            let Some(guard) = self.transcript.begin_cycle(self.config.queue_timeout).await else {
                cycle.step(RelayEvent::GateTimedOut);
                tracing::warn!(
                    wait_secs = self.config.queue_timeout.as_secs(),
                    "Rejected message, conversation busy"
                );
                return Err(RelayError::Busy);
            };

            self.transcript.append(Turn::user(text));
            tracing::info!(turns = self.transcript.len(), "User turn committed");
            cycle.step(RelayEvent::UserTurnAppended);

            let (tx, rx) = mpsc::channel(self.config.channel_capacity);
            cycle.step(RelayEvent::StreamOpened);
            Ok((guard, tx, rx))
        }
        .instrument(span.clone())
        .await?;

        let generation = self.bridge.open(&self.transcript.snapshot());
        let write_timeout = self.config.write_timeout;
        let task = tokio::spawn(
            cycle
                .stream(generation, tx, guard, write_timeout)
                .instrument(span),
        );

        Ok(RelayStream {
            request_id,
            fragments: rx,
            task,
        })
    }
}

/// The response side of one cycle
pub struct RelayStream {
    pub request_id: Uuid,
    fragments: mpsc::Receiver<String>,
    task: JoinHandle<RelayState>,
}

impl RelayStream {
    /// Next fragment, or `None` once the cycle closed the transport
    pub async fn recv(&mut self) -> Option<String> {
        self.fragments.recv().await
    }

    /// Body stream for the HTTP response. The cycle keeps running detached;
    /// dropping the body counts as a client disconnect.
    ///
    /// A cycle that gave up on a client still reading (write timeout) ends
    /// the body with an error, so the connection is aborted instead of
    /// closed cleanly over a truncated reply.
    pub fn into_body_stream(self) -> impl Stream<Item = Result<String, io::Error>> + Send {
        let Self { fragments, task, .. } = self;
        async_stream::stream! {
            let mut fragments = ReceiverStream::new(fragments);
            while let Some(fragment) = fragments.next().await {
                yield Ok(fragment);
            }
            let state = RelayStream::join(task).await;
            if state == (RelayState::StreamFailed { reason: FailureReason::ClientGone }) {
                yield Err(io::Error::new(io::ErrorKind::TimedOut, "client stopped reading"));
            }
        }
    }

    /// Read everything to the end, then report how the cycle ended
    pub async fn collect(mut self) -> (Vec<String>, RelayState) {
        let mut fragments = Vec::new();
        while let Some(fragment) = self.recv().await {
            fragments.push(fragment);
        }
        (fragments, Self::join(self.task).await)
    }

    /// Hang up, as a client closing its connection would
    pub async fn disconnect(self) -> RelayState {
        drop(self.fragments);
        Self::join(self.task).await
    }

    async fn join(task: JoinHandle<RelayState>) -> RelayState {
        match task.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Relay cycle task did not finish");
                RelayState::StreamFailed {
                    reason: FailureReason::Generation,
                }
            }
        }
    }
}

/// What woke the streaming loop
enum Step {
    Generated(Option<Result<String, String>>),
    ClientGone,
}

/// Driver that applies transitions and executes their effects
struct Cycle {
    state: RelayState,
    transcript: Arc<Transcript>,
}

impl Cycle {
    fn new(transcript: Arc<Transcript>) -> Self {
        Self {
            state: RelayState::Received,
            transcript,
        }
    }

    fn step(&mut self, event: RelayEvent) -> Vec<Effect> {
        match transition(&self.state, event) {
            Ok(result) => {
                tracing::debug!(from = ?self.state, to = ?result.new_state, "Relay transition");
                self.state = result.new_state;
                result.effects
            }
            Err(e) => {
                tracing::error!(error = %e, "Relay transition rejected");
                Vec::new()
            }
        }
    }

    async fn stream(
        mut self,
        mut generation: Generation,
        tx: mpsc::Sender<String>,
        guard: TurnGuard,
        write_timeout: Duration,
    ) -> RelayState {
        let mut pending = VecDeque::new();

        while !self.state.is_terminal() {
            let event = match pending.pop_front() {
                Some(event) => event,
                None => Self::next_event(&mut generation, &tx).await,
            };

            for effect in self.step(event) {
                match effect {
                    Effect::Forward { text } => {
                        if !send(&tx, text, write_timeout).await {
                            pending.push_back(RelayEvent::ClientGone);
                        }
                    }
                    Effect::CommitAssistantTurn { text } => {
                        self.transcript.append(Turn::assistant(text));
                        tracing::info!(
                            turns = self.transcript.len(),
                            fragments = generation.fragment_count(),
                            "Assistant turn committed"
                        );
                    }
                    Effect::WriteError => {
                        // Best effort; the client may already be gone
                        send(&tx, STREAM_ERROR_MESSAGE.to_string(), write_timeout).await;
                    }
                    Effect::Close => {}
                    Effect::Reject | Effect::AppendUserTurn { .. } | Effect::OpenStream => {
                        tracing::error!(?effect, "Unexpected effect while streaming");
                    }
                }
            }
        }

        if matches!(
            self.state,
            RelayState::StreamFailed {
                reason: FailureReason::ClientGone
            }
        ) {
            tracing::debug!(
                partial_bytes = generation.text().len(),
                "Client disconnected, reply discarded"
            );
        }

        // Close the transport first, then let the next cycle in
        drop(generation);
        drop(tx);
        drop(guard);
        self.state
    }

    async fn next_event(generation: &mut Generation, tx: &mpsc::Sender<String>) -> RelayEvent {
        let step = tokio::select! {
            biased;
            () = tx.closed() => Step::ClientGone,
            next = generation.next() => Step::Generated(next.map(|item| {
                item.map(crate::bridge::Fragment::into_string)
                    .map_err(|failure| failure.to_string())
            })),
        };

        match step {
            Step::ClientGone => RelayEvent::ClientGone,
            Step::Generated(Some(Ok(text))) => RelayEvent::Fragment { text },
            Step::Generated(None) => RelayEvent::GenerationDone {
                text: generation.text().to_string(),
            },
            Step::Generated(Some(Err(message))) => {
                tracing::warn!(error = %message, "Generation failed mid-stream");
                RelayEvent::GenerationFailed { message }
            }
        }
    }
}

/// Write one chunk; `false` means the client is gone or too slow
async fn send(tx: &mpsc::Sender<String>, text: String, write_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(write_timeout, tx.send(text)).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{MockLlmService, MockStep};
    use crate::llm::{LlmError, LlmMessage};
    use crate::transcript::Role;

    fn relay_with(mock: &Arc<MockLlmService>, config: RelayConfig) -> Relay {
        Relay::new(
            Arc::new(Transcript::new()),
            Bridge::new(mock.clone(), config.bridge),
            config,
        )
    }

    fn relay(mock: &Arc<MockLlmService>) -> Relay {
        relay_with(mock, RelayConfig::default())
    }

    fn roles_and_text(transcript: &Transcript) -> Vec<(Role, String)> {
        transcript
            .snapshot()
            .into_iter()
            .map(|t| (t.role, t.content))
            .collect()
    }

    #[tokio::test]
    async fn test_successful_cycle_commits_exact_reply() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_fragments(["Hi", " there", "!"]);
        let relay = relay(&mock);

        let stream = relay.submit(Some("Hello".into())).await.unwrap();
        let (fragments, state) = stream.collect().await;

        assert_eq!(fragments, vec!["Hi", " there", "!"]);
        assert_eq!(state, RelayState::Completed { fragments: 3 });
        assert_eq!(
            roles_and_text(relay.transcript()),
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi there!".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_writes_error_and_rolls_back() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![
            MockStep::fragment("Par"),
            MockStep::fail(LlmError::network("connection reset")),
        ]);
        let relay = relay(&mock);

        let (fragments, state) = relay.submit(Some("Hello".into())).await.unwrap().collect().await;

        assert_eq!(fragments, vec!["Par".to_string(), STREAM_ERROR_MESSAGE.to_string()]);
        assert_eq!(
            state,
            RelayState::StreamFailed {
                reason: FailureReason::Generation
            }
        );
        assert_eq!(
            roles_and_text(relay.transcript()),
            vec![(Role::User, "Hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_retry_after_failure_resends_same_context() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_open_error(LlmError::auth("GOOGLE_API_KEY is not set"));
        mock.queue_fragments(["Sure"]);
        let relay = relay(&mock);

        let (fragments, _) = relay.submit(Some("Hello".into())).await.unwrap().collect().await;
        assert_eq!(fragments, vec![STREAM_ERROR_MESSAGE.to_string()]);

        relay.submit(Some("Hello".into())).await.unwrap().collect().await;

        let transcript = roles_and_text(relay.transcript());
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[2], (Role::Assistant, "Sure".to_string()));

        // Second request saw both user turns and no partial assistant turn
        let requests = mock.recorded_requests();
        assert_eq!(
            requests[1].messages,
            vec![LlmMessage::user("Hello"), LlmMessage::user("Hello")]
        );
    }

    #[tokio::test]
    async fn test_empty_input_leaves_transcript_untouched() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let relay = relay(&mock);

        for message in [None, Some(String::new()), Some("  \n ".to_string())] {
            let err = relay.submit(message).await.err().unwrap();
            assert_eq!(err, RelayError::InvalidInput);
        }
        assert!(relay.transcript().is_empty());
        assert!(mock.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn test_n_cycles_alternate_roles() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let relay = relay(&mock);

        for i in 0..5 {
            mock.queue_fragments([format!("reply {i}")]);
            relay
                .submit(Some(format!("message {i}")))
                .await
                .unwrap()
                .collect()
                .await;
        }

        let turns = relay.transcript().snapshot();
        assert_eq!(turns.len(), 10);
        for (i, turn) in turns.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(turn.role, expected);
        }
    }

    #[tokio::test]
    async fn test_disconnect_stops_generation_without_commit() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![
            MockStep::fragment("first"),
            MockStep::delay(60_000),
            MockStep::fragment("never delivered"),
        ]);
        let relay = relay(&mock);

        let mut stream = relay.submit(Some("Hello".into())).await.unwrap();
        assert_eq!(stream.recv().await.as_deref(), Some("first"));
        let state = stream.disconnect().await;

        assert_eq!(
            state,
            RelayState::StreamFailed {
                reason: FailureReason::ClientGone
            }
        );
        assert_eq!(relay.transcript().len(), 1);
        assert_eq!(mock.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_do_not_interleave() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![
            MockStep::fragment("A1"),
            MockStep::delay(50),
            MockStep::fragment("A2"),
        ]);
        mock.queue_fragments(["B"]);
        let relay = Arc::new(relay(&mock));

        let first = relay.submit(Some("a".into())).await.unwrap();
        let second = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.submit(Some("b".into())).await.unwrap().collect().await })
        };

        let (first_fragments, _) = first.collect().await;
        let (second_fragments, _) = second.await.unwrap();

        assert_eq!(first_fragments, vec!["A1", "A2"]);
        assert_eq!(second_fragments, vec!["B"]);
        assert_eq!(
            roles_and_text(relay.transcript()),
            vec![
                (Role::User, "a".to_string()),
                (Role::Assistant, "A1A2".to_string()),
                (Role::User, "b".to_string()),
                (Role::Assistant, "B".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_busy_when_gate_not_released_in_time() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![MockStep::delay(500), MockStep::fragment("slow")]);
        let config = RelayConfig {
            queue_timeout: Duration::from_millis(20),
            ..RelayConfig::default()
        };
        let relay = relay_with(&mock, config);

        let first = relay.submit(Some("a".into())).await.unwrap();
        let err = relay.submit(Some("b".into())).await.err().unwrap();

        assert_eq!(err, RelayError::Busy);
        assert_eq!(relay.transcript().len(), 1);
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_timeout_reported_in_band() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![MockStep::fragment("a"), MockStep::delay(10_000)]);
        let config = RelayConfig {
            bridge: BridgeLimits {
                fragment_timeout: Duration::from_secs(1),
                ..BridgeLimits::default()
            },
            ..RelayConfig::default()
        };
        let relay = relay_with(&mock, config);

        let (fragments, state) = relay.submit(Some("x".into())).await.unwrap().collect().await;

        assert_eq!(fragments, vec!["a".to_string(), STREAM_ERROR_MESSAGE.to_string()]);
        assert!(matches!(state, RelayState::StreamFailed { .. }));
        assert_eq!(relay.transcript().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply_still_commits_assistant_turn() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_fragments(Vec::<String>::new());
        let relay = relay(&mock);

        let (fragments, state) = relay.submit(Some("hi".into())).await.unwrap().collect().await;

        assert!(fragments.is_empty());
        assert_eq!(state, RelayState::Completed { fragments: 0 });
        assert_eq!(relay.transcript().snapshot()[1].content, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_gets_aborted_body() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_fragments(["a", "b", "c", "d", "e"]);
        let config = RelayConfig {
            write_timeout: Duration::from_millis(20),
            channel_capacity: 1,
            ..RelayConfig::default()
        };
        let relay = relay_with(&mock, config);

        let body = relay.submit(Some("Hello".into())).await.unwrap().into_body_stream();
        // Nobody reads while the cycle is blocked on a full channel
        tokio::time::sleep(Duration::from_millis(200)).await;
        let items: Vec<_> = body.collect().await;

        let (last, delivered) = items.split_last().unwrap();
        assert!(last.is_err());
        assert!(delivered.iter().all(Result::is_ok));
        assert_eq!(delivered.len(), 1);
        assert_eq!(relay.transcript().len(), 1);
        assert_eq!(mock.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_body_stream_ends_cleanly_after_commit() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_fragments(["Hi", "!"]);
        let relay = relay(&mock);

        let body = relay.submit(Some("Hello".into())).await.unwrap().into_body_stream();
        let items: Vec<_> = body.collect().await;

        let text: String = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(text, "Hi!");
        assert_eq!(relay.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_body_stream_ends_without_error() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_script(vec![
            MockStep::fragment("Par"),
            MockStep::fail(LlmError::server_error("upstream 503")),
        ]);
        let relay = relay(&mock);

        let body = relay.submit(Some("Hello".into())).await.unwrap().into_body_stream();
        let items: Vec<_> = body.collect().await;

        assert!(items.iter().all(Result::is_ok));
        assert_eq!(items.last().unwrap().as_deref().unwrap(), STREAM_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_aborted_cycle_task_reports_failure() {
        let task = tokio::spawn(std::future::pending::<RelayState>());
        task.abort();

        assert_eq!(
            RelayStream::join(task).await,
            RelayState::StreamFailed {
                reason: FailureReason::Generation
            }
        );
    }
}
