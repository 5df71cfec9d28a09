//! Turn completion detection.
//!
//! A turn ends exactly once: on an explicit completion event, on an error
//! event, or on expiry of the safety timeout when the upstream never says
//! anything (it does not reliably emit a completion event). Competing
//! signals race, so the terminal state is a single-assignment cell rather
//! than a flag that is checked and then set.

use std::sync::Mutex;

/// Per-turn lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Active,
    Completed,
    Errored,
}

/// Set-once terminal cell guarding the single completion signal of a turn.
///
/// `try_complete` / `try_error` return whether the caller won the terminal
/// transition; every later call of either kind loses and must do nothing.
#[derive(Debug)]
pub struct CompletionGate {
    state: Mutex<TurnState>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TurnState::Active),
        }
    }

    /// Attempt the `Active -> Completed` transition.
    pub fn try_complete(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == TurnState::Active {
            *state = TurnState::Completed;
            true
        } else {
            false
        }
    }

    /// Attempt the `Active -> Errored` transition.
    pub fn try_error(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == TurnState::Active {
            *state = TurnState::Errored;
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != TurnState::Active
    }
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}
