//! Connection lifecycle.

use std::fmt;

use crate::error::StateError;

/// Where a connection is in its lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Candidates are being raced.
    Establishing,

    /// A transport won the race; data can flow.
    Established,

    /// `close` was called and the transport is being released.
    Closing,

    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Lower case name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The transitions a connection may take.
///
/// ```text
/// Establishing -> Established -> Closing -> Closed
///       |                                    ^
///       +------------------------------------+   (race lost or aborted)
/// ```
#[derive(Debug)]
pub(crate) struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Establishing,
        }
    }

    /// Passive connections start out established.
    pub(crate) fn established() -> Self {
        Self {
            state: ConnectionState::Established,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(
        &mut self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), StateError> {
        if self.state != from {
            return Err(StateError {
                state: self.state,
                expected: from,
            });
        }
        tracing::trace!(%from, %to, "connection state");
        self.state = to;
        Ok(())
    }

    /// A candidate won. Only ever succeeds once.
    pub(crate) fn establish(&mut self) -> Result<(), StateError> {
        self.transition(ConnectionState::Establishing, ConnectionState::Established)
    }

    /// Start closing an established connection.
    pub(crate) fn begin_close(&mut self) -> Result<(), StateError> {
        self.transition(ConnectionState::Established, ConnectionState::Closing)
    }

    /// The transport was released.
    pub(crate) fn finish_close(&mut self) -> Result<(), StateError> {
        self.transition(ConnectionState::Closing, ConnectionState::Closed)
    }

    /// Establishment failed or was abandoned.
    pub(crate) fn abandon(&mut self) -> Result<(), StateError> {
        self.transition(ConnectionState::Establishing, ConnectionState::Closed)
    }
}
