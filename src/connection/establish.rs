//! Establishing outgoing connections: protocol ranking, resolution,
//! candidate construction and racing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::Instrument as _;

use super::Connection;
use crate::candidate::{candidate_set, rank, unspecified_for, Candidate};
use crate::config::ConnectionConfig;
use crate::dns::IpAddrs;
use crate::endpoint::LocalEndpoint;
use crate::error::{AttemptError, Error};
use crate::interface::interfaces_addrs;
use crate::multicast::{self, MulticastMembership};
use crate::properties::{Direction, Protocol};
use crate::race::{Launch, RaceSet};
use crate::security::{server_name, SecurityContext};
use crate::session::datagram::DatagramSocket;
use crate::session::stream::StreamIo;
use crate::session::{Established, Transport};
use crate::{socket, BoxFuture};

type Attempt = BoxFuture<'static, Result<Established, AttemptError>>;

impl Connection {
    /// Race in the background. Must be called from within a Tokio runtime.
    pub(crate) fn start_establishing(&self) {
        let span = tracing::debug_span!("establish", remote = %self.remote_endpoint());
        let connection = self.clone();
        let handle = tokio::spawn(async move { connection.establish().await }.instrument(span))
            .abort_handle();
        *self.inner.establishing.lock() = Some(handle);
    }

    async fn establish(self) {
        let established = match self.race().await {
            Ok(established) => established,
            Err(error) => {
                if self.inner.state.lock().abandon().is_ok() {
                    tracing::debug!(%error, "establishment failed");
                    self.events().initiate_error(self.clone(), error);
                }
                return;
            }
        };

        tracing::debug!(
            protocol = %established.protocol,
            remote = %established.remote,
            "established"
        );

        if let Err(error) = self.establish_with(established) {
            tracing::debug!(%error, "connection left establishing while racing");
            return;
        }

        if let Some(framer) = self.inner.framer.clone() {
            if let Err(error) = framer.handle_start(&self).await {
                tracing::debug!(%error, "framer start failed");
                self.events()
                    .initiate_error(self.clone(), Error::initiate(error));
                self.close();
                return;
            }
        }

        self.events().ready(self.clone());
    }

    async fn race(&self) -> Result<Established, Error> {
        let protocols = rank(&self.inner.properties, &self.inner.protocols);
        if protocols.is_empty() {
            return Err(Error::initiate(AttemptError::new(
                "no protocol satisfies the transport properties",
            )));
        }
        tracing::trace!(?protocols, "ranked protocols");

        let security = match &self.inner.security {
            Some(parameters) => Some(parameters.client_context().map_err(Error::initiate)?),
            None => None,
        };

        let remote = self.remote_endpoint();
        let remotes = self.resolve_remote().await?;
        let locals = self.local_addrs()?;

        let candidates = candidate_set(
            &protocols,
            &remotes,
            remote.port(),
            locals.as_ref(),
            self.inner.local.port(),
        );
        if candidates.is_empty() {
            return Err(Error::initiate(AttemptError::new("candidate set is empty")));
        }

        let config = &self.inner.config;
        let mut race: RaceSet<Attempt, _, _> =
            RaceSet::new(config.racing_delay, config.establish_timeout);

        for candidate in candidates {
            let span = tracing::trace_span!("attempt", %candidate);
            let local = self.bind_addr(&candidate);
            match candidate.protocol() {
                Protocol::Tcp => {
                    let attempt = stream_attempt(
                        candidate.remote(),
                        local,
                        security.clone(),
                        remote.host_name().map(str::to_owned),
                        config.clone(),
                    );
                    race.push(Box::pin(attempt.instrument(span)), Launch::Staggered);
                }
                Protocol::Udp if security.is_some() => {
                    tracing::warn!(%candidate, "skipping datagram candidate for a secured connection");
                }
                Protocol::Udp => {
                    let attempt = datagram_attempt(
                        candidate.remote(),
                        local,
                        self.inner.properties.direction(),
                        self.inner.local.clone(),
                        config.clone(),
                    );
                    race.push(Box::pin(attempt.instrument(span)), Launch::Last);
                }
            }
        }

        race.finish().await.map_err(Error::initiate)
    }

    async fn resolve_remote(&self) -> Result<IpAddrs, Error> {
        let remote = self.remote_endpoint();
        let addrs = match remote.host_name() {
            Some(host) => {
                let addrs = self
                    .inner
                    .resolver
                    .resolve(host)
                    .await
                    .map_err(|error| Error::initiate(AttemptError::build(format!("resolving {host}"), error)))?;
                tracing::debug!(%host, %addrs, "resolved");
                addrs
            }
            None => IpAddrs::from_iter(remote.addresses().iter().copied()),
        };

        if addrs.is_empty() {
            return Err(Error::initiate(AttemptError::new(
                "remote endpoint has no address",
            )));
        }
        Ok(addrs)
    }

    /// Local addresses to pin candidates to, or `None` to let the system
    /// choose.
    fn local_addrs(&self) -> Result<Option<IpAddrs>, Error> {
        let local = &self.inner.local;
        if !local.is_pinned() {
            return Ok(None);
        }

        let mut addrs = interfaces_addrs(local.interfaces())
            .map_err(|error| Error::initiate(AttemptError::build("local interface", error)))?;
        addrs.extend(local.addresses().iter().copied());
        tracing::trace!(%addrs, "local addresses");
        Ok(Some(addrs))
    }

    /// The local address for a candidate: the pinned one, or a wildcard
    /// address when only a local port was asked for.
    fn bind_addr(&self, candidate: &Candidate) -> Option<SocketAddr> {
        let port = self.inner.local.port();
        candidate.local().or_else(|| {
            (port != 0).then(|| SocketAddr::new(unspecified_for(&candidate.remote().ip()), port))
        })
    }
}

async fn stream_attempt(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    security: Option<SecurityContext>,
    host: Option<String>,
    config: ConnectionConfig,
) -> Result<Established, AttemptError> {
    let stream = socket::tcp_connect(remote, local, &config)?.await?;
    let local = stream.local_addr().ok();
    tracing::trace!(?local, "tcp connected");

    let io = match security {
        Some(context) => {
            let name = server_name(host.as_deref(), remote.ip())
                .map_err(AttemptError::msg("tls server name"))?;
            let tls = socket::within(config.connect_timeout, context.connect(stream, name))
                .await
                .map_err(AttemptError::msg("tls handshake"))?;
            tracing::trace!("tls handshake complete");
            StreamIo::from(tls)
        }
        None => StreamIo::from(stream),
    };

    Ok(Established {
        transport: Transport::Stream(io),
        protocol: Protocol::Tcp,
        local,
        remote,
        membership: None,
    })
}

async fn datagram_attempt(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    direction: Direction,
    endpoint: LocalEndpoint,
    config: ConnectionConfig,
) -> Result<Established, AttemptError> {
    if remote.ip().is_multicast() {
        return multicast_receiver(remote.ip(), remote.port(), direction, &endpoint, &config);
    }

    let socket = socket::udp_connect(remote, local, &config)?;
    let local = socket.local_addr().ok();
    tracing::trace!(?local, "udp connected");

    Ok(Established {
        transport: Transport::Datagram(DatagramSocket::Owned(Arc::new(socket))),
        protocol: Protocol::Udp,
        local,
        remote,
        membership: None,
    })
}

/// Bind the group's port and join it. Only receivers may use a multicast
/// address.
fn multicast_receiver(
    group: IpAddr,
    port: u16,
    direction: Direction,
    endpoint: &LocalEndpoint,
    config: &ConnectionConfig,
) -> Result<Established, AttemptError> {
    if direction != Direction::UnidirectionalReceive {
        return Err(AttemptError::new(format!(
            "multicast group {group} requires a receive-only direction"
        )));
    }

    let socket = Arc::new(socket::udp_bind(
        multicast::bind_addr(group, port),
        true,
        config,
    )?);
    let membership = MulticastMembership::join(socket.clone(), group, endpoint)
        .map_err(AttemptError::msg("multicast join"))?;

    Ok(Established {
        local: socket.local_addr().ok(),
        transport: Transport::Datagram(DatagramSocket::Owned(socket)),
        protocol: Protocol::Udp,
        remote: SocketAddr::new(group, port),
        membership: Some(membership),
    })
}
