//! Property-based tests for the relay state machine
//!
//! Random event sequences are fed through `transition`, skipping the ones it
//! refuses, and the accumulated effects are checked for invariants.

use super::state::*;
use proptest::prelude::*;

fn arb_event() -> impl Strategy<Value = RelayEvent> {
    prop_oneof![
        proptest::option::of("[a-z ]{0,8}").prop_map(|message| RelayEvent::Submit { message }),
        Just(RelayEvent::GateTimedOut),
        Just(RelayEvent::UserTurnAppended),
        Just(RelayEvent::StreamOpened),
        "[a-z]{1,4}".prop_map(|text| RelayEvent::Fragment { text }),
        "[a-z]{0,8}".prop_map(|text| RelayEvent::GenerationDone { text }),
        "[a-z]{1,8}".prop_map(|message| RelayEvent::GenerationFailed { message }),
        Just(RelayEvent::ClientGone),
    ]
}

/// Apply events, ignoring invalid ones; returns final state and all effects
fn run(events: Vec<RelayEvent>) -> (RelayState, Vec<Effect>) {
    let mut state = RelayState::Received;
    let mut effects = Vec::new();
    for event in events {
        if let Ok(result) = transition(&state, event) {
            state = result.new_state;
            effects.extend(result.effects);
        }
    }
    (state, effects)
}

fn position(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> Option<usize> {
    effects.iter().position(pred)
}

proptest! {
    #[test]
    fn prop_commit_at_most_once_and_only_on_completion(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (state, effects) = run(events);
        let commits = effects
            .iter()
            .filter(|e| matches!(e, Effect::CommitAssistantTurn { .. }))
            .count();

        prop_assert!(commits <= 1);
        prop_assert_eq!(commits == 1, matches!(state, RelayState::Completed { .. }));
    }

    #[test]
    fn prop_user_turn_precedes_stream(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (_, effects) = run(events);
        let append = position(&effects, |e| matches!(e, Effect::AppendUserTurn { .. }));
        let open = position(&effects, |e| matches!(e, Effect::OpenStream));

        if let Some(open) = open {
            prop_assert!(append.is_some_and(|a| a < open));
        }
        let appends = effects.iter().filter(|e| matches!(e, Effect::AppendUserTurn { .. })).count();
        prop_assert!(appends <= 1);
    }

    #[test]
    fn prop_no_effects_after_terminal(events in proptest::collection::vec(arb_event(), 0..30)) {
        let mut state = RelayState::Received;
        for event in events {
            let was_terminal = state.is_terminal();
            if let Ok(result) = transition(&state, event) {
                if was_terminal {
                    prop_assert!(result.effects.is_empty());
                    prop_assert_eq!(&result.new_state, &state);
                }
                state = result.new_state;
            }
        }
    }

    #[test]
    fn prop_forward_count_matches_state(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (state, effects) = run(events);
        let forwards = effects.iter().filter(|e| matches!(e, Effect::Forward { .. })).count();

        match state {
            RelayState::Streaming { fragments } | RelayState::Completed { fragments } => {
                prop_assert_eq!(fragments, forwards);
            }
            _ => {}
        }
    }

    #[test]
    fn prop_error_fragment_only_for_generation_failure(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (state, effects) = run(events);
        let wrote_error = effects.contains(&Effect::WriteError);

        prop_assert_eq!(
            wrote_error,
            state == RelayState::StreamFailed { reason: FailureReason::Generation }
        );
    }

    #[test]
    fn prop_rejection_has_no_side_effects(message in proptest::option::of("[ \t\n]{0,5}")) {
        let result = transition(&RelayState::Received, RelayEvent::Submit { message }).unwrap();
        prop_assert_eq!(result.new_state, RelayState::RejectedInput);
        prop_assert_eq!(result.effects, vec![Effect::Reject]);
    }
}
