//! Datagram transports.
//!
//! An outgoing session owns a UDP socket connected to its peer. Sessions
//! accepted by a listener share the listener's socket: the listener reads and
//! routes datagrams by source address, and replies go out with `send_to`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use super::Incoming;
use crate::connection::Connection;

/// Passive datagram connections of one listening socket, by peer address.
///
/// An entry keeps its connection open until the connection closes or the
/// listener stops.
pub(crate) type Demux = Arc<Mutex<HashMap<SocketAddr, Connection>>>;

/// The socket a datagram session sends on.
#[derive(Debug, Clone)]
pub(crate) enum DatagramSocket {
    /// A socket owned by the session, connected to the peer (or, for a
    /// multicast receiver, bound to the group).
    Owned(Arc<UdpSocket>),

    /// The listener's socket, shared by every peer it has seen.
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        demux: Demux,
    },
}

impl DatagramSocket {
    pub(crate) async fn send(&self, data: &[u8]) -> io::Result<()> {
        let (sent, len) = match self {
            Self::Owned(socket) => (socket.send(data).await?, data.len()),
            Self::Shared { socket, peer, .. } => (socket.send_to(data, peer).await?, data.len()),
        };

        if sent != len {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: sent {sent} of {len} bytes"),
            ));
        }
        Ok(())
    }

    /// Stop routing datagrams to this session.
    pub(crate) fn detach(&self) {
        if let Self::Shared { peer, demux, .. } = self {
            let released = demux.lock().remove(peer);
            tracing::trace!(%peer, routed = released.is_some(), "datagram peer detached");
        }
    }
}

/// Receive datagrams on a socket owned by the session.
///
/// ICMP port unreachable surfaces as a refused receive on connected sockets;
/// it is reported as a connection error and reading continues.
pub(super) async fn read_loop(
    socket: Arc<UdpSocket>,
    connection: Connection,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size.max(1)];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                tracing::trace!(bytes = n, "datagram");
                connection.ingest(Incoming::Data(Bytes::copy_from_slice(&buf[..n])));
            }
            Err(error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!(%error, "datagram refused by peer");
                connection.fault(error);
            }
            Err(error) => {
                tracing::debug!(%error, "datagram receive failed");
                connection.fault(error);
                return;
            }
        }
    }
}
