//! Process-lifetime conversation transcript
//!
//! An append-only log of turns shared by every request. Two locks guard it:
//! a short data lock taken only inside `append`/`snapshot`, and a cycle gate
//! that a request holds from its user turn until its assistant turn (or its
//! failure), so no foreign turn can land between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One committed message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Held by one request cycle; dropping it lets the next cycle in
#[derive(Debug)]
pub struct TurnGuard {
    _gate: OwnedMutexGuard<()>,
}

/// The single shared conversation log
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Mutex<Vec<Turn>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to the end of the log
    pub fn append(&self, turn: Turn) {
        self.turns().push(turn);
    }

    /// Copy of the log as it stands right now
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns().clone()
    }

    pub fn len(&self) -> usize {
        self.turns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns().is_empty()
    }

    /// Wait for exclusive use of the transcript boundary.
    ///
    /// Returns `None` if another cycle still holds the gate after `wait`.
    pub async fn begin_cycle(&self, wait: Duration) -> Option<TurnGuard> {
        let gate = Arc::clone(&self.gate);
        tokio::time::timeout(wait, gate.lock_owned())
            .await
            .ok()
            .map(|guard| TurnGuard { _gate: guard })
    }

    // Poison is ignored: push and clone never leave the Vec half-written.
    fn turns(&self) -> MutexGuard<'_, Vec<Turn>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
