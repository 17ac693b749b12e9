//! Socket and racing configuration shared by connections and listeners.

use std::time::Duration;

/// Wait between launching stream candidates while racing.
pub const RACING_DELAY: Duration = Duration::from_millis(100);

/// Configuration for establishing and driving connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time to wait after launching a stream candidate before launching the
    /// next one. Cut short as soon as any attempt finishes.
    pub racing_delay: Duration,

    /// The timeout for a single TCP connect (including the TLS handshake).
    pub connect_timeout: Option<Duration>,

    /// Upper bound for the whole race. `None` waits for every candidate.
    pub establish_timeout: Option<Duration>,

    /// The TCP keep-alive idle time.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the socket send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the socket receive buffer.
    pub recv_buffer_size: Option<usize>,

    /// How many bytes a stream session reads from the socket at once.
    pub read_chunk_size: usize,

    /// The largest datagram a datagram session can receive.
    pub max_datagram_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            racing_delay: RACING_DELAY,
            connect_timeout: Some(Duration::from_secs(10)),
            establish_timeout: None,
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            read_chunk_size: 8 * 1024,
            max_datagram_size: 64 * 1024,
        }
    }
}
