//! Socket construction with socket2, converted to tokio sockets once
//! configured.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::AttemptError;

const LISTEN_BACKLOG: i32 = 1024;

fn apply_buffer_sizes(socket: &Socket, config: &ConnectionConfig) {
    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("set_send_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("set_recv_buffer_size error: {}", e);
        }
    }
}

fn reuse_address(socket: &Socket, config: &ConnectionConfig) {
    if config.reuse_address {
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("set_reuse_address error: {}", e);
        }
    }
}

/// Start a TCP connect to `remote`, optionally from a fixed local address.
///
/// Socket setup errors are returned right away; the connect itself (bounded by
/// the configured timeout) is the returned future.
#[tracing::instrument(skip(config), level = "debug")]
pub(crate) fn tcp_connect(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    config: &ConnectionConfig,
) -> Result<impl Future<Output = Result<TcpStream, AttemptError>>, AttemptError> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))
        .map_err(AttemptError::msg("tcp open error"))?;

    // tokio sockets must be non-blocking.
    socket
        .set_nonblocking(true)
        .map_err(AttemptError::msg("tcp set_nonblocking error"))?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if config.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    reuse_address(&socket, config);
    apply_buffer_sizes(&socket, config);

    if let Some(local) = local {
        socket
            .bind(&local.into())
            .map_err(AttemptError::msg("tcp bind local address"))?;
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    let connect = socket.connect(remote);
    let timeout = config.connect_timeout;

    Ok(async move {
        within(timeout, connect)
            .await
            .map_err(AttemptError::msg("tcp connect error"))
    })
}

/// Open a UDP socket connected to `remote`. UDP has no handshake, so this
/// completes immediately.
#[tracing::instrument(skip(config), level = "debug")]
pub(crate) fn udp_connect(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    config: &ConnectionConfig,
) -> Result<UdpSocket, AttemptError> {
    let socket = udp_socket(remote, config)?;

    let local = local.unwrap_or_else(|| SocketAddr::new(unspecified(remote), 0));
    socket
        .bind(&local.into())
        .map_err(AttemptError::msg("udp bind local address"))?;
    socket
        .connect(&remote.into())
        .map_err(AttemptError::msg("udp connect error"))?;

    UdpSocket::from_std(socket.into()).map_err(AttemptError::msg("udp register error"))
}

/// Bind a UDP socket for receiving.
///
/// Shared binds also set `SO_REUSEPORT` where available, so several receivers
/// on one host can join the same multicast group and port.
#[tracing::instrument(skip(config), level = "debug")]
pub(crate) fn udp_bind(
    local: SocketAddr,
    shared: bool,
    config: &ConnectionConfig,
) -> Result<UdpSocket, AttemptError> {
    let socket = udp_socket(local, config)?;

    if shared {
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("udp set_reuse_address error: {}", e);
        }
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if let Err(e) = socket.set_reuse_port(true) {
            warn!("udp set_reuse_port error: {}", e);
        }
    }

    socket
        .bind(&local.into())
        .map_err(AttemptError::msg("udp bind error"))?;

    UdpSocket::from_std(socket.into()).map_err(AttemptError::msg("udp register error"))
}

/// Bind a TCP listening socket.
#[tracing::instrument(skip(config), level = "debug")]
pub(crate) fn tcp_listen(
    local: SocketAddr,
    config: &ConnectionConfig,
) -> Result<TcpListener, AttemptError> {
    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))
        .map_err(AttemptError::msg("tcp open error"))?;

    socket
        .set_nonblocking(true)
        .map_err(AttemptError::msg("tcp set_nonblocking error"))?;

    // Listening on both families at once binds each separately.
    if local.is_ipv6() {
        if let Err(e) = socket.set_only_v6(true) {
            warn!("tcp set_only_v6 error: {}", e);
        }
    }

    reuse_address(&socket, config);
    apply_buffer_sizes(&socket, config);

    socket
        .bind(&local.into())
        .map_err(AttemptError::msg("tcp bind error"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(AttemptError::msg("tcp listen error"))?;

    TcpListener::from_std(socket.into()).map_err(AttemptError::msg("tcp register error"))
}

fn udp_socket(addr: SocketAddr, config: &ConnectionConfig) -> Result<Socket, AttemptError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(AttemptError::msg("udp open error"))?;

    socket
        .set_nonblocking(true)
        .map_err(AttemptError::msg("udp set_nonblocking error"))?;

    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(true) {
            warn!("udp set_only_v6 error: {}", e);
        }
    }

    apply_buffer_sizes(&socket, config);
    Ok(socket)
}

fn unspecified(addr: SocketAddr) -> std::net::IpAddr {
    crate::candidate::unspecified_for(&addr.ip())
}

/// Run `future`, failing with `TimedOut` if it takes longer than `timeout`.
pub(crate) async fn within<F, T>(timeout: Option<Duration>, future: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, future).await {
            Ok(result) => result,
            Err(elapsed) => Err(io::Error::new(io::ErrorKind::TimedOut, elapsed)),
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn tcp_connect_to_listener() {
        let config = ConnectionConfig::default();
        let listener = tcp_listen(localhost(0), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let (stream, accepted) = tokio::join!(
            async { tcp_connect(addr, None, &config).unwrap().await },
            listener.accept()
        );

        let stream = stream.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn tcp_connect_refused() {
        let config = ConnectionConfig::default();
        let addr = {
            let listener = std::net::TcpListener::bind(localhost(0)).unwrap();
            listener.local_addr().unwrap()
        };

        let err = tcp_connect(addr, None, &config).unwrap().await.unwrap_err();
        assert!(err.to_string().starts_with("tcp connect error"));
    }

    #[tokio::test]
    async fn udp_pair() {
        let config = ConnectionConfig::default();
        let server = udp_bind(localhost(0), false, &config).unwrap();
        let client = udp_connect(server.local_addr().unwrap(), None, &config).unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn within_times_out() {
        let err = within(Some(Duration::from_millis(10)), std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
