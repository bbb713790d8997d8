//! Session lifecycle states.
//!
//! ```text
//! Uninitialized -> Initializing -> Active -> Closing -> Closed
//!       ^               |                       ^
//!       +---------------+ (handshake rejected)  |
//!                                               |
//!   Uninitialized / Initializing / Active ------+
//! ```
//!
//! `Closed` is terminal. The state is shared between concurrently running
//! tasks, so unlike a compile-time typestate it is a plain enum with an
//! explicit transition table; the session controller stores it in an atomic
//! using [`SessionState::as_u8`] / [`SessionState::from_u8`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// No handshake has been sent yet.
    Uninitialized = 0,
    /// The handshake request is in flight.
    Initializing = 1,
    /// The handshake completed; the session is operational.
    Active = 2,
    /// Close has started; in-flight work is being drained.
    Closing = 3,
    /// The session is gone. Terminal.
    Closed = 4,
}

impl SessionState {
    /// Encode the state for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a state from atomic storage.
    ///
    /// Unknown values decode as `Closed`, the safest reading.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Whether this state accepts new outbound operations.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Initializing | Self::Active)
    }

    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Uninitialized, Self::Initializing)
            | (Self::Initializing, Self::Active | Self::Uninitialized)
            | (Self::Uninitialized | Self::Initializing | Self::Active, Self::Closing)
            | (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 5] = [
        SessionState::Uninitialized,
        SessionState::Initializing,
        SessionState::Active,
        SessionState::Closing,
        SessionState::Closed,
    ];

    #[test]
    fn test_u8_encoding_roundtrip() {
        for state in ALL {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::from_u8(200), SessionState::Closed);
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in ALL {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(SessionState::Uninitialized.can_transition_to(SessionState::Initializing));
        assert!(SessionState::Initializing.can_transition_to(SessionState::Active));
        assert!(SessionState::Active.can_transition_to(SessionState::Closing));
        assert!(SessionState::Closing.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!SessionState::Uninitialized.can_transition_to(SessionState::Active));
        assert!(!SessionState::Active.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Closing.can_transition_to(SessionState::Active));
        assert!(!SessionState::Active.can_transition_to(SessionState::Initializing));
    }

    #[test]
    fn test_open_states() {
        assert!(SessionState::Active.is_open());
        assert!(!SessionState::Closing.is_open());
        assert!(!SessionState::Closed.is_open());
    }
}
