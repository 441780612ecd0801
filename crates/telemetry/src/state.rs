//! Connection state machine.
//!
//! The supervisor never assigns a [`ConnectionState`] directly; it feeds
//! [`Transition`]s through [`ConnectionState::apply`], and anything not in
//! the table is rejected.

use std::fmt;

use serde::Serialize;

/// Connectivity health as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `connect()` started a supervision task.
    Connect,
    /// The transport handshake succeeded.
    Established,
    /// A handshake failed and another attempt is scheduled.
    AttemptFailed,
    /// An established session dropped.
    Lost,
    /// The retry budget is spent.
    Exhausted,
    /// `disconnect()` was called.
    Disconnect,
}

impl ConnectionState {
    /// Look up the transition table. `None` means the transition is illegal
    /// from the current state.
    pub fn apply(self, transition: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;
        use Transition as T;

        match (self, transition) {
            (_, T::Disconnect) => Some(Disconnected),

            (Disconnected | Failed, T::Connect) => Some(Connecting),

            (Connecting | Reconnecting, T::Established) => Some(Connected),
            (Connecting | Reconnecting, T::AttemptFailed) => Some(Reconnecting),
            (Connecting | Reconnecting, T::Exhausted) => Some(Failed),

            (Connected, T::Lost) => Some(Reconnecting),

            _ => None,
        }
    }

    /// A supervision task is alive (connecting, connected or backing off).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}
