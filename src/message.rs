//! Per-message metadata and receive requests.

use std::net::SocketAddr;

/// Metadata delivered alongside received data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl MessageContext {
    /// A context carrying the session's addresses.
    pub fn new(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self { local, remote }
    }

    /// The local address the message arrived on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// The peer the message came from.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

/// Bounds for one receive call.
///
/// `min_incomplete_length` is how much stream data must be buffered before a
/// partial delivery is made; `None` waits for the end of the stream.
/// `max_length` caps the size of one delivery; `None` delivers everything
/// buffered. Datagram sessions always deliver exactly one whole datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Minimum buffered length for a partial delivery.
    pub min_incomplete_length: Option<usize>,

    /// Maximum length of one delivery.
    pub max_length: Option<usize>,
}

impl ReceiveRequest {
    /// Wait for the end of the stream and deliver everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver once at least `len` bytes are buffered.
    pub fn with_min_incomplete_length(mut self, len: usize) -> Self {
        self.min_incomplete_length = Some(len);
        self
    }

    /// Deliver at most `len` bytes at a time.
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub(crate) fn min(&self) -> usize {
        self.min_incomplete_length.unwrap_or(usize::MAX)
    }
}
