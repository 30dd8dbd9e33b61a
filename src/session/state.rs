//! Client lifecycle state machine
//!
//! Tracks the mirroring session through connect, stream and teardown, and
//! rejects transitions the lifecycle does not allow.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use crate::error::{MirrorError, Result};

/// Lifecycle states of a mirroring client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Created, never started
    Idle,
    /// Deploying the server and performing the handshake
    Connecting,
    /// Video and control connections are live
    Streaming,
    /// Teardown in progress
    Disconnecting,
    /// Stopped; may be started again
    Disconnected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => write!(f, "Idle"),
            ClientState::Connecting => write!(f, "Connecting"),
            ClientState::Streaming => write!(f, "Streaming"),
            ClientState::Disconnecting => write!(f, "Disconnecting"),
            ClientState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

impl ClientState {
    /// Returns true while the session owns live connections
    pub fn is_alive(&self) -> bool {
        matches!(self, ClientState::Streaming)
    }

    /// Returns true if `start` may be called
    pub fn can_start(&self) -> bool {
        matches!(self, ClientState::Idle | ClientState::Disconnected)
    }

    /// Returns valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [ClientState] {
        match self {
            ClientState::Idle => &[ClientState::Connecting],
            ClientState::Connecting => &[ClientState::Streaming, ClientState::Disconnected],
            ClientState::Streaming => &[ClientState::Disconnecting],
            ClientState::Disconnecting => &[ClientState::Disconnected],
            ClientState::Disconnected => &[ClientState::Connecting],
        }
    }
}

/// Record of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// Previous state
    pub from: ClientState,
    /// New state
    pub to: ClientState,
    /// When the transition occurred
    pub timestamp: Instant,
}

/// Validated lifecycle state with a bounded transition history
#[derive(Debug)]
pub struct ClientStateMachine {
    current: ClientState,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
    max_history: usize,
}

impl Default for ClientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStateMachine {
    const DEFAULT_MAX_HISTORY: usize = 32;

    /// Creates a state machine in the Idle state
    pub fn new() -> Self {
        Self {
            current: ClientState::Idle,
            state_entered_at: Instant::now(),
            history: VecDeque::new(),
            max_history: Self::DEFAULT_MAX_HISTORY,
        }
    }

    /// Returns the current state
    pub fn current(&self) -> ClientState {
        self.current
    }

    /// Returns true if the transition is valid
    pub fn can_transition(&self, to: ClientState) -> bool {
        self.current.valid_transitions().contains(&to)
    }

    /// Moves to `to`
    ///
    /// # Errors
    ///
    /// Returns `MirrorError::InvalidState` if the lifecycle forbids it
    pub fn transition(&mut self, to: ClientState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(MirrorError::InvalidState(format!(
                "cannot go from {} to {}",
                self.current, to
            )));
        }
        self.record(to);
        Ok(())
    }

    /// Moves to `to` without validation
    ///
    /// Used when a pending start is abandoned.
    pub fn force_transition(&mut self, to: ClientState) {
        self.record(to);
    }

    fn record(&mut self, to: ClientState) {
        let transition = StateTransition {
            from: self.current,
            to,
            timestamp: Instant::now(),
        };
        self.current = to;
        self.state_entered_at = transition.timestamp;

        self.history.push_back(transition);
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Returns how long we've been in the current state
    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    /// Returns the transition history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// Returns the last transition, if any
    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.back()
    }
}
