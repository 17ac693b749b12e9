//! Error taxonomy for connection establishment and data transfer.
//!
//! None of these errors are returned from the asynchronous entry points.
//! They are handed to the matching optional handler in [`crate::events`]
//! when the failure is detected.

use std::fmt;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::BoxError;

/// Errors reported through the connection and listener event handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Establishment could not start or ran out of candidates: the candidate
    /// set was empty, or address resolution failed.
    #[error("initiate: {0}")]
    Initiate(#[source] BoxError),

    /// An asynchronous socket fault occured on an established connection.
    #[error("connection: {0}")]
    Connection(#[source] BoxError),

    /// A message could not be sent, either because the connection is not
    /// established or because the write failed.
    #[error("send: {0}")]
    Send(#[source] BoxError),

    /// No listening candidate could be set up.
    #[error("listen: {0}")]
    Listen(#[source] BoxError),

    /// A framer could not decode received data. Transports themselves never
    /// produce this.
    #[error("receive: {0}")]
    Receive(#[source] BoxError),
}

impl Error {
    pub(crate) fn initiate<E: Into<BoxError>>(error: E) -> Self {
        Self::Initiate(error.into())
    }

    pub(crate) fn connection<E: Into<BoxError>>(error: E) -> Self {
        Self::Connection(error.into())
    }

    pub(crate) fn send<E: Into<BoxError>>(error: E) -> Self {
        Self::Send(error.into())
    }

    pub(crate) fn listen<E: Into<BoxError>>(error: E) -> Self {
        Self::Listen(error.into())
    }

    pub(crate) fn receive<E: Into<BoxError>>(error: E) -> Self {
        Self::Receive(error.into())
    }
}

/// The connection was in the wrong state for the requested operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection is {state}, expected {expected}")]
pub struct StateError {
    pub(crate) state: ConnectionState,
    pub(crate) expected: ConnectionState,
}

impl StateError {
    /// The state the connection was in.
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Error from a single candidate attempt: resolving, binding, connecting or
/// handshaking with one (protocol, local, remote) combination.
#[derive(Debug, Error)]
pub struct AttemptError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl AttemptError {
    pub(crate) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    pub(crate) fn build<S, E>(message: S, error: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}
