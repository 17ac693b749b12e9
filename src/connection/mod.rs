//! Connections.
//!
//! A [`Connection`] is a cheap, cloneable handle. Outgoing connections are
//! created in the establishing state by [`Preconnection::initiate`] and race
//! their candidates in the background; connections accepted by a
//! [`Listener`](crate::Listener) start out established.
//!
//! Nothing here blocks or returns errors: every outcome is reported through
//! the connection's event handlers, which are always run later on the
//! runtime.
//!
//! [`Preconnection::initiate`]: crate::Preconnection::initiate

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::ConnectionConfig;
use crate::dns::Resolver;
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::{Error, StateError};
use crate::events::EventDispatcher;
use crate::framer::Framer;
use crate::message::{MessageContext, ReceiveRequest};
use crate::multicast::MulticastMembership;
use crate::preconnection::Preconnection;
use crate::properties::{Protocol, ProtocolTable, TransportProperties};
use crate::security::SecurityParameters;
use crate::session::receive::Delivery;
use crate::session::{Established, Incoming, TransportSession};

mod establish;
mod state;

pub use self::state::ConnectionState;
pub(crate) use self::state::ConnectionStateMachine;

/// A message oriented connection over whichever transport won the race.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalEndpoint,
    remote: Mutex<RemoteEndpoint>,
    properties: TransportProperties,
    security: Option<SecurityParameters>,
    framer: Option<Arc<dyn Framer>>,
    protocols: ProtocolTable,
    config: ConnectionConfig,
    resolver: Resolver,
    active: bool,

    state: Mutex<ConnectionStateMachine>,
    session: Mutex<Option<Arc<TransportSession>>>,
    events: EventDispatcher,

    /// Last sequence number handed out by `send`.
    sequence: AtomicU64,

    /// Receive requests made while a framer is attached and not yet answered
    /// with `deliver`.
    open_receives: AtomicUsize,

    /// Receive requests made before a transport was established.
    early_receives: Mutex<Vec<ReceiveRequest>>,

    /// Work for the framer, run one job at a time by a single task.
    framer_jobs: mpsc::UnboundedSender<FramerJob>,
    framer_idle: Mutex<Option<mpsc::UnboundedReceiver<FramerJob>>>,

    establishing: Mutex<Option<AbortHandle>>,
    multicast: Mutex<Option<MulticastMembership>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("active", &self.inner.active)
            .field("remote", &*self.inner.remote.lock())
            .field("session", &*self.inner.session.lock())
            .finish()
    }
}

enum FramerJob {
    /// Data arrived; call the framer once per open receive request.
    Parse(usize),

    /// Encode and write one message.
    Send {
        seq: u64,
        data: Bytes,
        context: MessageContext,
    },
}

/// A non-owning reference held by the tasks serving a connection.
#[derive(Clone)]
pub(crate) struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Connection {
    fn new(
        preconnection: &Preconnection,
        active: bool,
        state: ConnectionStateMachine,
        remote: RemoteEndpoint,
    ) -> Self {
        let (framer_jobs, framer_idle) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                local: preconnection.local.clone(),
                remote: Mutex::new(remote),
                properties: preconnection.properties.clone(),
                security: preconnection.security.clone(),
                framer: preconnection.framer.clone(),
                protocols: preconnection.protocols.clone(),
                config: preconnection.config.clone(),
                resolver: preconnection.resolver.clone(),
                active,
                state: Mutex::new(state),
                session: Mutex::new(None),
                events: EventDispatcher::new(preconnection.handlers.inherited()),
                sequence: AtomicU64::new(0),
                open_receives: AtomicUsize::new(0),
                early_receives: Mutex::new(Vec::new()),
                framer_jobs,
                framer_idle: Mutex::new(Some(framer_idle)),
                establishing: Mutex::new(None),
                multicast: Mutex::new(None),
            }),
        }
    }

    /// An outgoing connection which has not raced yet.
    pub(crate) fn active(preconnection: &Preconnection) -> Self {
        Self::new(
            preconnection,
            true,
            ConnectionStateMachine::new(),
            preconnection.remote.clone(),
        )
    }

    /// A connection accepted by a listener, already established over
    /// `established`.
    pub(crate) fn passive(preconnection: &Preconnection, established: Established) -> Self {
        let connection = Self::new(
            preconnection,
            false,
            ConnectionStateMachine::established(),
            RemoteEndpoint::from(established.remote),
        );
        connection.attach(established);
        connection
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    fn session(&self) -> Option<Arc<TransportSession>> {
        self.inner.session.lock().clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state()
    }

    /// Whether this side opened the connection.
    pub fn is_active(&self) -> bool {
        self.inner.active
    }

    /// The local endpoint the connection was created with.
    pub fn local_endpoint(&self) -> &LocalEndpoint {
        &self.inner.local
    }

    /// The remote endpoint. Once established, its address is the peer the
    /// winning transport is connected to.
    pub fn remote_endpoint(&self) -> RemoteEndpoint {
        self.inner.remote.lock().clone()
    }

    /// The transport properties the connection was created with.
    pub fn transport_properties(&self) -> &TransportProperties {
        &self.inner.properties
    }

    /// The protocol of the established transport.
    pub fn protocol(&self) -> Option<Protocol> {
        self.session().map(|session| session.protocol())
    }

    /// The local address of the established transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session().and_then(|session| session.local_addr())
    }

    /// The peer address of the established transport.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session().map(|session| session.remote_addr())
    }

    /// Send one message and return its sequence number.
    ///
    /// Sequence numbers start at 1 and are handed out in call order, whether
    /// or not the send succeeds. The outcome is reported with `sent` or
    /// `send_error` for the same number. On a connection which is not
    /// established nothing is written and `send_error` fires.
    pub fn send(&self, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let seq = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let state = self.state();
        let session = match (state, self.session()) {
            (ConnectionState::Established, Some(session)) => session,
            _ => {
                tracing::debug!(seq, %state, "send on a connection which is not established");
                self.events().send_error(
                    seq,
                    Error::send(StateError {
                        state,
                        expected: ConnectionState::Established,
                    }),
                );
                return seq;
            }
        };

        if self.inner.framer.is_some() {
            let context = session.context();
            self.framer_job(FramerJob::Send { seq, data, context });
        } else if let Err(error) = session.send(seq, data) {
            self.events().send_error(seq, Error::send(error));
        }

        seq
    }

    /// Ask for the next message.
    ///
    /// Returns immediately; the data arrives through `received` (a whole
    /// datagram, or the end of a stream) or `received_partial` (stream data
    /// before its end). Requests are answered in the order they were made.
    /// See [`ReceiveRequest`] for the bounds.
    pub fn receive(&self, request: ReceiveRequest) {
        if self.inner.framer.is_some() {
            self.inner.open_receives.fetch_add(1, Ordering::SeqCst);
            if self.session().is_some_and(|session| session.has_data()) {
                self.notify_framer(1);
            }
            return;
        }

        let session = {
            let session = self.inner.session.lock();
            match &*session {
                Some(session) => session.clone(),
                None => {
                    tracing::trace!("receive queued until established");
                    self.inner.early_receives.lock().push(request);
                    return;
                }
            }
        };

        let context = session.context();
        session.receive(request, |deliveries| self.dispatch(deliveries, context));
    }

    /// Close the connection.
    ///
    /// Queued messages are written first, then the transport is released,
    /// the connection becomes closed and `closed` fires. A connection still
    /// racing stops racing. Closing twice has no further effect.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        match state.state() {
            ConnectionState::Establishing => {
                if state.abandon().is_ok() {
                    drop(state);
                    tracing::debug!("closed while establishing");
                    if let Some(race) = self.inner.establishing.lock().take() {
                        race.abort();
                    }
                    self.events().closed();
                }
            }
            ConnectionState::Established => {
                if state.begin_close().is_ok() {
                    drop(state);
                    let membership = self.inner.multicast.lock().take();
                    let session = self.session();
                    let connection = self.clone();
                    tokio::spawn(async move {
                        if let Some(membership) = membership {
                            if let Err(error) = membership.leave() {
                                tracing::warn!(%error, "leaving multicast group");
                            }
                        }
                        if let Some(session) = session {
                            session.close().await;
                        }
                        let closed = connection.inner.state.lock().finish_close();
                        if closed.is_ok() {
                            tracing::debug!("connection closed");
                            connection.events().closed();
                        }
                    });
                }
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                tracing::trace!(state = %state.state(), "close on a closing connection");
            }
        }
    }

    /// Install the winning transport and move to established.
    ///
    /// Fails if the connection left the establishing state in the meantime,
    /// in which case the transport is dropped.
    pub(crate) fn establish_with(&self, established: Established) -> Result<(), StateError> {
        {
            let mut state = self.inner.state.lock();
            state.establish()?;
        }

        let remote = established.remote;
        {
            let mut endpoint = self.inner.remote.lock();
            let mut updated = RemoteEndpoint::from(remote);
            if let Some(host) = endpoint.host_name() {
                updated = updated.with_host_name(host);
            }
            *endpoint = updated;
        }

        self.attach(established);
        Ok(())
    }

    fn attach(&self, mut established: Established) {
        if let Some(membership) = established.membership.take() {
            *self.inner.multicast.lock() = Some(membership);
        }

        let (session, driver) = TransportSession::new(established, self, &self.inner.config);
        let session = Arc::new(session);
        {
            // Early requests are queued ahead of any made once the session is
            // visible. Nothing is buffered until the driver runs.
            let mut installed = self.inner.session.lock();
            *installed = Some(session.clone());
            let early = std::mem::take(&mut *self.inner.early_receives.lock());
            let context = session.context();
            for request in early {
                session.receive(request, |deliveries| {
                    self.dispatch(deliveries, context.clone())
                });
            }
        }
        session.run(driver);
    }

    /// Network input for the active session.
    pub(crate) fn ingest(&self, incoming: Incoming) {
        let Some(session) = self.session() else {
            tracing::warn!("input for a connection without a session");
            return;
        };

        let data = matches!(incoming, Incoming::Data(_));
        let context = session.context();
        session.ingest(incoming, |deliveries| self.dispatch(deliveries, context));

        if data && self.inner.framer.is_some() {
            let open = self.inner.open_receives.load(Ordering::SeqCst);
            self.notify_framer(open);
        }
    }

    /// An asynchronous fault on the established transport.
    pub(crate) fn fault(&self, error: io::Error) {
        self.events().connection_error(Error::connection(error));
    }

    fn dispatch(&self, deliveries: Vec<Delivery>, context: MessageContext) {
        for delivery in deliveries {
            if delivery.complete {
                self.events()
                    .received(delivery.data, context.clone(), self.clone());
            } else {
                self.events()
                    .received_partial(delivery.data, context.clone(), false, self.clone());
            }
        }
    }

    fn notify_framer(&self, times: usize) {
        if times > 0 {
            self.framer_job(FramerJob::Parse(times));
        }
    }

    fn framer_job(&self, job: FramerJob) {
        let Some(framer) = self.inner.framer.clone() else {
            return;
        };

        if let Some(jobs) = self.inner.framer_idle.lock().take() {
            tokio::spawn(framer_loop(framer, jobs, self.downgrade()));
        }
        if self.inner.framer_jobs.send(job).is_err() {
            tracing::debug!("framer queue closed, dropping job");
        }
    }

    /// Write bytes to the transport without framing. For framers.
    pub async fn write_raw(&self, data: impl Into<Bytes>) -> io::Result<()> {
        let session = self.session().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection is not established")
        })?;
        session.write_raw(data.into()).await
    }

    /// The received bytes not yet consumed by the framer. For datagram
    /// transports this is the oldest unconsumed datagram.
    pub fn parse(&self) -> Bytes {
        self.session()
            .map(|session| session.snapshot())
            .unwrap_or_default()
    }

    /// Consume `n` bytes from the front of the receive buffer. For framers.
    pub fn advance_receive_cursor(&self, n: usize) {
        if let Some(session) = self.session() {
            session.advance(n);
        }
    }

    /// Answer one open receive request with a decoded message. For framers.
    pub fn deliver(&self, data: impl Into<Bytes>, context: MessageContext, end_of_message: bool) {
        let _ = self
            .inner
            .open_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1));

        let data = data.into();
        if end_of_message {
            self.events().received(data, context, self.clone());
        } else {
            self.events()
                .received_partial(data, context, false, self.clone());
        }
    }

    /// The message context for the established transport.
    pub fn message_context(&self) -> MessageContext {
        self.session()
            .map(|session| session.context())
            .unwrap_or_default()
    }
}

async fn framer_loop(
    framer: Arc<dyn Framer>,
    mut jobs: mpsc::UnboundedReceiver<FramerJob>,
    connection: WeakConnection,
) {
    while let Some(job) = jobs.recv().await {
        let Some(connection) = connection.upgrade() else {
            return;
        };

        match job {
            FramerJob::Parse(times) => {
                for _ in 0..times {
                    if let Err(error) = framer.handle_received_data(&connection).await {
                        tracing::debug!(%error, "framer failed to parse received data");
                        connection.events().receive_error(Error::receive(error));
                    }
                }
            }
            FramerJob::Send { seq, data, context } => {
                match framer
                    .handle_new_sent_message(&connection, data, context, true)
                    .await
                {
                    Ok(()) => connection.events().sent(seq),
                    Err(error) => connection.events().send_error(seq, Error::send(error)),
                }
            }
        }
    }
}

macro_rules! handler_setters {
    ($($(#[$meta:meta])* $name:ident => $slot:ident: Fn($($arg:ty),*);)*) => {
        impl Connection {
            $(
                $(#[$meta])*
                pub fn $name<F>(&self, handler: F) -> &Self
                where
                    F: Fn($($arg),*) + Send + Sync + 'static,
                {
                    self.events().update(|handlers| handlers.$slot = Some(Arc::new(handler)));
                    self
                }
            )*
        }
    };
}

handler_setters! {
    /// Called once the connection is established.
    on_ready => ready: Fn(Connection);

    /// Called when establishment fails.
    on_initiate_error => initiate_error: Fn(Connection, Error);

    /// Called with the sequence number of every message written.
    on_sent => sent: Fn(u64);

    /// Called with the sequence number of every message that could not be
    /// written.
    on_send_error => send_error: Fn(u64, Error);

    /// Called with each complete message.
    on_received => received: Fn(Bytes, MessageContext, Connection);

    /// Called with partial stream data. The flag is the end-of-message marker.
    on_received_partial => received_partial: Fn(Bytes, MessageContext, bool, Connection);

    /// Called when a framer cannot decode received data.
    on_receive_error => receive_error: Fn(Error);

    /// Called on transport faults after establishment.
    on_connection_error => connection_error: Fn(Error);

    /// Called once the connection is closed.
    on_closed => closed: Fn();
}
