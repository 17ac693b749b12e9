//! Passive open.
//!
//! A [`Listener`] binds every (address, protocol) candidate derived from its
//! preconnection and turns incoming peers into established [`Connection`]s.
//! Stream peers are accepted one socket each. Datagram peers share the
//! listening socket: datagrams are routed by source address, and the first
//! datagram from an unknown peer creates its connection.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::Instrument as _;

use crate::candidate::rank;
use crate::connection::Connection;
use crate::dns::IpAddrs;
use crate::error::{AttemptError, Error};
use crate::events::EventDispatcher;
use crate::interface::interfaces_addrs;
use crate::multicast::{self, MulticastMembership};
use crate::preconnection::Preconnection;
use crate::properties::{Direction, Protocol};
use crate::security::SecurityContext;
use crate::session::datagram::{DatagramSocket, Demux};
use crate::session::stream::StreamIo;
use crate::session::{Established, Incoming, Transport};
use crate::socket;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts incoming connections for a [`Preconnection`].
///
/// Created by [`Preconnection::listen`]. Binding happens in the background;
/// [`local_addrs`](Listener::local_addrs) waits for it. The listener keeps
/// accepting until [`stop`](Listener::stop) is called or every handle to it
/// is dropped.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    preconnection: Preconnection,
    events: EventDispatcher,
    bound: watch::Sender<Option<Vec<(Protocol, SocketAddr)>>>,
    running: Mutex<Running>,
}

#[derive(Default)]
struct Running {
    stopped: bool,
    tasks: Vec<AbortHandle>,
    memberships: Vec<MulticastMembership>,
    demuxes: Vec<Demux>,
}

impl Running {
    /// Hand back every datagram connection the listener is holding open.
    fn release_peers(&mut self) -> Vec<HashMap<SocketAddr, Connection>> {
        self.demuxes
            .drain(..)
            .map(|demux| std::mem::take(&mut *demux.lock()))
            .collect()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let running = self.running.get_mut();
        for task in running.tasks.drain(..) {
            task.abort();
        }
        let released = running.release_peers();
        tracing::trace!(sockets = released.len(), "released datagram peers");
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.inner.preconnection.local)
            .field("bound", &*self.inner.bound.borrow())
            .field("stopped", &self.inner.running.lock().stopped)
            .finish()
    }
}

impl Inner {
    fn accepted(&self, established: Established) -> Connection {
        let connection = Connection::passive(&self.preconnection, established);
        self.events.connection_received(connection.clone());
        connection
    }
}

/// A bound listening candidate.
enum Bound {
    Stream(TcpListener),
    Datagram {
        socket: Arc<UdpSocket>,
        membership: Option<MulticastMembership>,
    },
}

impl Bound {
    fn local_addr(&self) -> io::Result<(Protocol, SocketAddr)> {
        match self {
            Self::Stream(listener) => Ok((Protocol::Tcp, listener.local_addr()?)),
            Self::Datagram { socket, .. } => Ok((Protocol::Udp, socket.local_addr()?)),
        }
    }
}

impl Listener {
    /// Start listening. Must be called from within a Tokio runtime.
    pub(crate) fn start(preconnection: Preconnection) -> Self {
        let (bound, _) = watch::channel(None);
        let listener = Self {
            inner: Arc::new(Inner {
                events: EventDispatcher::new(preconnection.handlers.clone()),
                preconnection,
                bound,
                running: Mutex::new(Running::default()),
            }),
        };

        let span = tracing::debug_span!("listen", local = ?listener.inner.preconnection.local);
        let setup = tokio::spawn(setup(Arc::downgrade(&listener.inner)).instrument(span));
        listener.inner.running.lock().tasks.push(setup.abort_handle());
        listener
    }

    /// The protocols and addresses being listened on, once binding is done.
    ///
    /// Empty if nothing could be bound, or if the listener was stopped before
    /// binding finished.
    pub async fn local_addrs(&self) -> Vec<(Protocol, SocketAddr)> {
        let mut bound = self.inner.bound.subscribe();
        let addrs = match bound.wait_for(Option::is_some).await {
            Ok(addrs) => addrs.clone().unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        addrs
    }

    /// The first address bound for `protocol`.
    pub async fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.local_addrs()
            .await
            .into_iter()
            .find_map(|(bound, addr)| (bound == protocol).then_some(addr))
    }

    /// Whether [`stop`](Listener::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.running.lock().stopped
    }

    /// Stop accepting.
    ///
    /// Listening sockets are closed and multicast groups left. Stream
    /// connections already accepted are not affected. Datagram connections
    /// no longer receive, and the listener stops holding them open.
    /// `stopped` fires once.
    pub fn stop(&self) {
        let (tasks, memberships, released) = {
            let mut running = self.inner.running.lock();
            if running.stopped {
                return;
            }
            running.stopped = true;
            (
                std::mem::take(&mut running.tasks),
                std::mem::take(&mut running.memberships),
                running.release_peers(),
            )
        };
        drop(released);

        for task in tasks {
            task.abort();
        }
        for membership in memberships {
            if let Err(error) = membership.leave() {
                tracing::warn!(%error, "leaving multicast group");
            }
        }

        self.inner.bound.send_if_modified(|bound| {
            if bound.is_none() {
                *bound = Some(Vec::new());
                true
            } else {
                false
            }
        });

        tracing::debug!("listener stopped");
        self.inner.events.stopped();
    }
}

macro_rules! handler_setters {
    ($($(#[$meta:meta])* $name:ident => $slot:ident: Fn($($arg:ty),*);)*) => {
        impl Listener {
            $(
                $(#[$meta])*
                pub fn $name<F>(&self, handler: F) -> &Self
                where
                    F: Fn($($arg),*) + Send + Sync + 'static,
                {
                    self.inner.events.update(|handlers| handlers.$slot = Some(Arc::new(handler)));
                    self
                }
            )*
        }
    };
}

handler_setters! {
    /// Called for every accepted connection.
    on_connection_received => connection_received: Fn(Connection);

    /// Called when nothing could be bound.
    on_listen_error => listen_error: Fn(Error);

    /// Called once the listener has stopped.
    on_stopped => stopped: Fn();
}

async fn setup(listener: Weak<Inner>) {
    let Some(preconnection) = listener.upgrade().map(|inner| inner.preconnection.clone()) else {
        return;
    };

    let bound = match bind(&preconnection).await {
        Ok(bound) => bound,
        Err(error) => {
            if let Some(inner) = listener.upgrade() {
                tracing::debug!(%error, "listen failed");
                inner.bound.send_replace(Some(Vec::new()));
                inner.events.listen_error(error);
            }
            return;
        }
    };

    let Some(inner) = listener.upgrade() else {
        return;
    };

    let security = match &preconnection.security {
        Some(parameters) => match parameters.server_context() {
            Ok(context) => Some(context),
            Err(error) => {
                inner.bound.send_replace(Some(Vec::new()));
                inner.events.listen_error(Error::listen(error));
                return;
            }
        },
        None => None,
    };

    let mut running = inner.running.lock();
    if running.stopped {
        for bound in bound {
            if let Bound::Datagram {
                membership: Some(membership),
                ..
            } = bound
            {
                if let Err(error) = membership.leave() {
                    tracing::warn!(%error, "leaving multicast group");
                }
            }
        }
        return;
    }

    let mut addrs = Vec::with_capacity(bound.len());
    for bound in bound {
        let addr = match bound.local_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::warn!(%error, "listening socket has no local address");
                continue;
            }
        };
        tracing::info!(protocol = %addr.0, local = %addr.1, "listening");
        addrs.push(addr);

        let span = tracing::debug_span!("accept", protocol = %addr.0, local = %addr.1);
        let task = match bound {
            Bound::Stream(tcp) => tokio::spawn(
                accept_loop(listener.clone(), tcp, security.clone()).instrument(span),
            ),
            Bound::Datagram { socket, membership } => {
                running.memberships.extend(membership);
                let demux = Demux::default();
                running.demuxes.push(demux.clone());
                tokio::spawn(datagram_loop(listener.clone(), socket, demux).instrument(span))
            }
        };
        running.tasks.push(task.abort_handle());
    }
    drop(running);

    inner.bound.send_replace(Some(addrs));
}

/// Bind every listening candidate. Fails only if none could be bound.
async fn bind(preconnection: &Preconnection) -> Result<Vec<Bound>, Error> {
    let protocols = rank(&preconnection.properties, &preconnection.protocols);
    if protocols.is_empty() {
        return Err(Error::listen(AttemptError::new(
            "no protocol satisfies the transport properties",
        )));
    }

    let addrs = listen_addrs(preconnection).await?;
    let port = preconnection.local.port();
    let config = &preconnection.config;
    let direction = preconnection.properties.direction();

    let mut bound = Vec::new();
    let mut last_error = None;
    for addr in addrs.iter() {
        let local = SocketAddr::new(addr, port);
        for protocol in &protocols {
            let result = match protocol {
                Protocol::Tcp if addr.is_multicast() => {
                    tracing::debug!(%local, "no stream listener on a multicast address");
                    continue;
                }
                Protocol::Tcp => socket::tcp_listen(local, config).map(Bound::Stream),
                Protocol::Udp if preconnection.security.is_some() => {
                    tracing::warn!(%local, "skipping datagram listener for a secured preconnection");
                    continue;
                }
                Protocol::Udp if addr.is_multicast() => {
                    multicast_bind(addr, port, direction, preconnection)
                }
                Protocol::Udp => socket::udp_bind(local, false, config).map(|socket| Bound::Datagram {
                    socket: Arc::new(socket),
                    membership: None,
                }),
            };

            match result {
                Ok(socket) => bound.push(socket),
                Err(error) => {
                    tracing::debug!(%protocol, %local, %error, "listening candidate failed");
                    last_error = Some(error);
                }
            }
        }
    }

    if bound.is_empty() {
        let error = match last_error {
            Some(error) => AttemptError::build("no listening candidate could be set up", error),
            None => AttemptError::new("no listening candidate could be set up"),
        };
        return Err(Error::listen(error));
    }

    Ok(bound)
}

/// The local host name's addresses, the explicit addresses, then those of
/// the pinned interfaces. The IPv4 wildcard if none are given.
async fn listen_addrs(preconnection: &Preconnection) -> Result<IpAddrs, Error> {
    let local = &preconnection.local;
    let mut addrs = IpAddrs::new();

    if let Some(host) = local.host_name() {
        let resolved = preconnection.resolver.resolve(host).await.map_err(|error| {
            Error::listen(AttemptError::build(format!("resolving {host}"), error))
        })?;
        tracing::debug!(%host, addrs = %resolved, "resolved local host");
        addrs.extend(resolved.iter());
    }

    addrs.extend(local.addresses().iter().copied());
    addrs.extend(
        interfaces_addrs(local.interfaces())
            .map_err(|error| Error::listen(AttemptError::build("local interface", error)))?
            .iter(),
    );

    if addrs.is_empty() {
        addrs.push(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    Ok(addrs)
}

fn multicast_bind(
    group: IpAddr,
    port: u16,
    direction: Direction,
    preconnection: &Preconnection,
) -> Result<Bound, AttemptError> {
    if direction != Direction::UnidirectionalReceive {
        return Err(AttemptError::new(format!(
            "multicast group {group} requires a receive-only direction"
        )));
    }

    let socket = Arc::new(socket::udp_bind(
        multicast::bind_addr(group, port),
        true,
        &preconnection.config,
    )?);
    let membership = MulticastMembership::join(socket.clone(), group, &preconnection.local)
        .map_err(AttemptError::msg("multicast join"))?;

    Ok(Bound::Datagram {
        socket,
        membership: Some(membership),
    })
}

fn is_connection_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

async fn accept_loop(listener: Weak<Inner>, tcp: TcpListener, security: Option<SecurityContext>) {
    loop {
        let (stream, remote) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(error) if is_connection_error(&error) => {
                tracing::trace!(%error, "accept error");
                continue;
            }
            Err(error) => {
                tracing::debug!(%error, "accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Some(inner) = listener.upgrade() else {
            return;
        };
        tracing::trace!(%remote, "accepted");

        let local = stream.local_addr().ok();
        let timeout = inner.preconnection.config.connect_timeout;
        drop(inner);

        let security = security.clone();
        let listener = listener.clone();
        let span = tracing::debug_span!("connection", %remote);
        tokio::spawn(
            async move {
                let io = match security {
                    Some(context) => match socket::within(timeout, context.accept(stream)).await {
                        Ok(tls) => StreamIo::from(tls),
                        Err(error) => {
                            tracing::debug!(%error, "tls accept failed");
                            return;
                        }
                    },
                    None => StreamIo::from(stream),
                };

                let Some(inner) = listener.upgrade() else {
                    return;
                };
                if inner.running.lock().stopped {
                    return;
                }

                inner.accepted(Established {
                    transport: Transport::Stream(io),
                    protocol: Protocol::Tcp,
                    local,
                    remote,
                    membership: None,
                });
            }
            .instrument(span),
        );
    }
}

async fn datagram_loop(listener: Weak<Inner>, socket: Arc<UdpSocket>, demux: Demux) {
    let Some(max_datagram_size) = listener
        .upgrade()
        .map(|inner| inner.preconnection.config.max_datagram_size)
    else {
        return;
    };

    let local = socket.local_addr().ok();
    let mut buf = vec![0u8; max_datagram_size.max(1)];

    loop {
        let (n, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) if is_connection_error(&error) => {
                tracing::trace!(%error, "datagram receive error");
                continue;
            }
            Err(error) => {
                tracing::warn!(%error, "datagram listener failed");
                return;
            }
        };
        let data = Bytes::copy_from_slice(&buf[..n]);

        let known = demux.lock().get(&remote).cloned();
        let connection = match known {
            Some(connection) => connection,
            None => {
                let Some(inner) = listener.upgrade() else {
                    return;
                };
                // Registered under the running lock so `stop` cannot miss it.
                let running = inner.running.lock();
                if running.stopped {
                    return;
                }
                tracing::debug!(%remote, "new datagram peer");
                let connection = inner.accepted(Established {
                    transport: Transport::Datagram(DatagramSocket::Shared {
                        socket: socket.clone(),
                        peer: remote,
                        demux: demux.clone(),
                    }),
                    protocol: Protocol::Udp,
                    local,
                    remote,
                    membership: None,
                });
                demux.lock().insert(remote, connection.clone());
                drop(running);
                connection
            }
        };

        tracing::trace!(%remote, bytes = n, "datagram");
        connection.ingest(Incoming::Data(data));
    }
}
