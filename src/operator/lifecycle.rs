//! Operator lifecycle state machine
//!
//! ```text
//! Idle -> Initializing -> Ready -> Running -> {Completed | Error} -> Stopped
//!                                  Running <-> Paused
//! ```
//!
//! Terminal states (`Completed`, `Error`) may be reset to `Ready`, and a
//! `Stopped` operator may be initialized again. Concrete operators embed a
//! [`Lifecycle`] rather than inheriting one.
//!
//! Callers that share an instance take its [`Lifecycle::execution_gate`]
//! before `execute`, so they queue instead of tripping `AlreadyRunning`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorState {
    Idle,
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl OperatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperatorState::Completed | OperatorState::Error)
    }

    /// Whether `self -> to` is an edge of the state machine
    pub fn can_transition(&self, to: OperatorState) -> bool {
        use OperatorState::*;

        matches!(
            (*self, to),
            (Idle, Initializing)
                | (Stopped, Initializing)
                | (Initializing, Ready)
                | (Initializing, Error)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Paused)
                | (Paused, Running)
                | (Completed, Ready)
                | (Error, Ready)
                | (Idle, Stopped)
                | (Ready, Stopped)
                | (Paused, Stopped)
                | (Completed, Stopped)
                | (Error, Stopped)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: OperatorState,
        to: OperatorState,
    },

    /// `execute` was called while a previous call is still running
    #[error("contract violation: execute called while RUNNING")]
    AlreadyRunning,

    #[error("operator not ready (state {0:?})")]
    NotReady(OperatorState),
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<OperatorState>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OperatorState::Idle),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// One holder at a time; held for the whole of an `execute` call
    pub fn execution_gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.gate.clone()
    }

    pub fn state(&self) -> OperatorState {
        *self.state.lock()
    }

    pub fn transition(&self, to: OperatorState) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if !state.can_transition(to) {
            return Err(LifecycleError::InvalidTransition { from: *state, to });
        }
        tracing::trace!(from = ?*state, to = ?to, "operator state transition");
        *state = to;
        Ok(())
    }

    /// Enter `Running` for one execute call
    ///
    /// Accepts `Ready`, or a terminal state which is reset to `Ready` first.
    /// The check and the transition happen under one lock, so two concurrent
    /// callers can never both enter `Running`.
    pub fn begin_execution(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match *state {
            OperatorState::Running => Err(LifecycleError::AlreadyRunning),
            OperatorState::Ready => {
                *state = OperatorState::Running;
                Ok(())
            }
            s if s.is_terminal() => {
                // reset, then start
                *state = OperatorState::Running;
                Ok(())
            }
            other => Err(LifecycleError::NotReady(other)),
        }
    }

    /// Leave `Running` with the outcome of the call
    pub fn finish_execution(&self, success: bool) {
        let mut state = self.state.lock();
        if *state == OperatorState::Running {
            *state = if success {
                OperatorState::Completed
            } else {
                OperatorState::Error
            };
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
