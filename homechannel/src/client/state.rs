//! Connection State Machine
//!
//! Valid transitions for one client connection:
//!
//! ```text
//! ┌──────────────┐     connect()      ┌──────────────┐
//! │ Disconnected │ ─────────────────► │  Connecting  │
//! └──────────────┘                    └──────┬───────┘
//!        ▲   ▲                               │
//!        │   │ any failure                   │ transport open
//!        │   └───────────────────────────────┤
//!        │                                   ▼
//!        │         disconnect()       ┌──────────────┐
//!        └─────────────────────────── │  Connected   │
//!                                     └──────────────┘
//! ```
//!
//! There is no error state: a failed attempt goes straight back to
//! `Disconnected` and the error is kept for inspection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Client connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// An attempt is running through the establishment steps
    Connecting,
    /// The direct transport is open
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// State machine for the connection lifecycle
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    last_error: Option<String>,
    state_changed_at: Instant,
    transition_count: u32,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            state_changed_at: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Error that ended the most recent failed attempt
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_changed_at.elapsed()
    }

    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Begin an attempt. Only allowed from `Disconnected`.
    pub fn start_connecting(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            ConnectionState::Disconnected => {
                self.transition_to(ConnectionState::Connecting);
                self.last_error = None;
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Connecting,
            }),
        }
    }

    pub fn connect_success(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            ConnectionState::Connecting => {
                self.transition_to(ConnectionState::Connected);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Connected,
            }),
        }
    }

    /// Abort the attempt (or the live connection) with an error.
    ///
    /// Allowed from any state. Returns whether the state changed.
    pub fn fail(&mut self, error: String) -> bool {
        self.last_error = Some(error);
        self.force_disconnected()
    }

    /// Return to `Disconnected`. Returns whether the state changed.
    pub fn disconnect(&mut self) -> bool {
        self.force_disconnected()
    }

    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    fn force_disconnected(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        self.transition_to(ConnectionState::Disconnected);
        true
    }

    fn transition_to(&mut self, new_state: ConnectionState) {
        tracing::debug!(
            "[client] state transition: {} -> {} (count: {})",
            self.state,
            new_state,
            self.transition_count + 1
        );
        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.transition_count += 1;
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        sm.start_connecting().unwrap();
        assert_eq!(sm.state(), ConnectionState::Connecting);

        sm.connect_success().unwrap();
        assert_eq!(sm.state(), ConnectionState::Connected);

        assert!(sm.disconnect());
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(sm.transition_count(), 3);
    }

    #[test]
    fn test_failure_reverts_to_disconnected() {
        let mut sm = ConnectionStateMachine::new();
        sm.start_connecting().unwrap();
        assert!(sm.fail("Authentication failed".into()));

        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(sm.last_error(), Some("Authentication failed"));

        // A new attempt clears the previous error
        sm.start_connecting().unwrap();
        assert_eq!(sm.last_error(), None);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = ConnectionStateMachine::new();
        assert!(sm.connect_success().is_err());

        sm.start_connecting().unwrap();
        assert!(sm.start_connecting().is_err());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut sm = ConnectionStateMachine::new();
        assert!(!sm.disconnect());
        assert!(!sm.fail("late".into()));
        assert_eq!(sm.transition_count(), 0);
    }
}
