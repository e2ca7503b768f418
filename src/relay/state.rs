//! Per-request relay state machine
//!
//! Pure transitions: given a state and an event, produce the next state and
//! the effects the driver must carry out. No I/O happens here.

use thiserror::Error;

/// Where one request cycle stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Received,
    Validated,
    UserTurnCommitted,
    Streaming { fragments: usize },
    Completed { fragments: usize },
    RejectedInput,
    /// Another cycle held the transcript for too long
    RejectedBusy,
    StreamFailed { reason: FailureReason },
}

/// Why a stream ended without committing a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Generation,
    ClientGone,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayState::Completed { .. }
                | RelayState::RejectedInput
                | RelayState::RejectedBusy
                | RelayState::StreamFailed { .. }
        )
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Submit { message: Option<String> },
    GateTimedOut,
    UserTurnAppended,
    StreamOpened,
    Fragment { text: String },
    GenerationDone { text: String },
    GenerationFailed { message: String },
    ClientGone,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Answer with a client error; nothing was mutated
    Reject,
    AppendUserTurn { text: String },
    OpenStream,
    Forward { text: String },
    CommitAssistantTurn { text: String },
    /// Best-effort in-band error; headers are already sent
    WriteError,
    Close,
}

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: RelayState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: RelayState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(
    state: &RelayState,
    event: RelayEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        (RelayState::Received, RelayEvent::Submit { message }) => match message {
            Some(text) if !text.trim().is_empty() => Ok(TransitionResult::new(
                RelayState::Validated,
            )
            .with_effect(Effect::AppendUserTurn { text })),
            _ => Ok(TransitionResult::new(RelayState::RejectedInput).with_effect(Effect::Reject)),
        },

        (RelayState::Validated, RelayEvent::GateTimedOut) => {
            Ok(TransitionResult::new(RelayState::RejectedBusy).with_effect(Effect::Reject))
        }

        (RelayState::Validated, RelayEvent::UserTurnAppended) => {
            Ok(TransitionResult::new(RelayState::UserTurnCommitted).with_effect(Effect::OpenStream))
        }

        (RelayState::UserTurnCommitted, RelayEvent::StreamOpened) => {
            Ok(TransitionResult::new(RelayState::Streaming { fragments: 0 }))
        }

        (RelayState::Streaming { fragments }, RelayEvent::Fragment { text }) => {
            Ok(TransitionResult::new(RelayState::Streaming {
                fragments: fragments + 1,
            })
            .with_effect(Effect::Forward { text }))
        }

        (RelayState::Streaming { fragments }, RelayEvent::GenerationDone { text }) => {
            Ok(TransitionResult::new(RelayState::Completed {
                fragments: *fragments,
            })
            .with_effect(Effect::CommitAssistantTurn { text })
            .with_effect(Effect::Close))
        }

        (RelayState::Streaming { .. }, RelayEvent::GenerationFailed { .. }) => {
            Ok(TransitionResult::new(RelayState::StreamFailed {
                reason: FailureReason::Generation,
            })
            .with_effect(Effect::WriteError)
            .with_effect(Effect::Close))
        }

        // Nobody left to write an error to
        (
            RelayState::UserTurnCommitted | RelayState::Streaming { .. },
            RelayEvent::ClientGone,
        ) => Ok(TransitionResult::new(RelayState::StreamFailed {
            reason: FailureReason::ClientGone,
        })
        .with_effect(Effect::Close)),

        // Late disconnect after the cycle already ended
        (state, RelayEvent::ClientGone) if state.is_terminal() => {
            Ok(TransitionResult::new(state.clone()))
        }

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{event:?} in {state:?}"
        ))),
    }
}
