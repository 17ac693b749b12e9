//! The entry point: everything needed to open or accept connections.

use std::fmt;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::dns::Resolver;
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::Error;
use crate::events::EventHandlers;
use crate::framer::Framer;
use crate::listener::Listener;
use crate::properties::{ProtocolTable, TransportProperties};
use crate::security::SecurityParameters;

/// Endpoints, properties and handlers, ready to be turned into connections.
///
/// A preconnection is a builder: set what is needed, then call
/// [`initiate`](Preconnection::initiate) for an outgoing connection or
/// [`listen`](Preconnection::listen) to accept incoming ones. It can be used
/// any number of times.
#[derive(Clone, Default)]
pub struct Preconnection {
    pub(crate) local: LocalEndpoint,
    pub(crate) remote: RemoteEndpoint,
    pub(crate) properties: TransportProperties,
    pub(crate) security: Option<SecurityParameters>,
    pub(crate) framer: Option<Arc<dyn Framer>>,
    pub(crate) protocols: ProtocolTable,
    pub(crate) config: ConnectionConfig,
    pub(crate) resolver: Resolver,
    pub(crate) handlers: EventHandlers,
}

impl fmt::Debug for Preconnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preconnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("properties", &self.properties)
            .field("security", &self.security)
            .field("framer", &self.framer.is_some())
            .field("protocols", &self.protocols)
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Preconnection {
    /// An empty preconnection: no endpoints, no preferences, TCP and UDP as
    /// the known protocols.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local endpoint.
    pub fn with_local_endpoint(mut self, local: LocalEndpoint) -> Self {
        self.local = local;
        self
    }

    /// Set the remote endpoint.
    pub fn with_remote_endpoint(mut self, remote: RemoteEndpoint) -> Self {
        self.remote = remote;
        self
    }

    /// Set the transport properties protocols are ranked against.
    pub fn with_transport_properties(mut self, properties: TransportProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Secure stream transports with TLS.
    pub fn with_security_parameters(mut self, security: SecurityParameters) -> Self {
        self.security = Some(security);
        self
    }

    /// Frame messages with `framer`.
    pub fn with_framer<F: Framer>(mut self, framer: F) -> Self {
        self.framer = Some(Arc::new(framer));
        self
    }

    /// Replace the table of known protocols.
    pub fn with_protocol_table(mut self, protocols: ProtocolTable) -> Self {
        self.protocols = protocols;
        self
    }

    /// Replace the socket and racing configuration.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve host names with `resolver`.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// The local endpoint.
    pub fn local_endpoint(&self) -> &LocalEndpoint {
        &self.local
    }

    /// The remote endpoint.
    pub fn remote_endpoint(&self) -> &RemoteEndpoint {
        &self.remote
    }

    /// The transport properties.
    pub fn transport_properties(&self) -> &TransportProperties {
        &self.properties
    }

    /// The socket and racing configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open an outgoing connection.
    ///
    /// The connection is returned right away in the establishing state while
    /// candidates race in the background. `ready` or `initiate_error` reports
    /// the outcome. Must be called from within a Tokio runtime.
    pub fn initiate(&self) -> Connection {
        let connection = Connection::active(self);
        connection.start_establishing();
        connection
    }

    /// Accept incoming connections.
    ///
    /// Every accepted connection is reported with `connection_received`.
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self) -> Listener {
        Listener::start(self.clone())
    }
}

macro_rules! handler_builders {
    ($($(#[$meta:meta])* $name:ident => $slot:ident: Fn($($arg:ty),*);)*) => {
        impl Preconnection {
            $(
                $(#[$meta])*
                pub fn $name<F>(mut self, handler: F) -> Self
                where
                    F: Fn($($arg),*) + Send + Sync + 'static,
                {
                    self.handlers.$slot = Some(Arc::new(handler));
                    self
                }
            )*
        }
    };
}

handler_builders! {
    /// Called when an outgoing connection is established.
    on_ready => ready: Fn(Connection);

    /// Called when an outgoing connection cannot be established.
    on_initiate_error => initiate_error: Fn(Connection, Error);

    /// Called for every connection a listener accepts.
    on_connection_received => connection_received: Fn(Connection);

    /// Called when a listener cannot listen anywhere.
    on_listen_error => listen_error: Fn(Error);

    /// Called once a listener has stopped.
    on_stopped => stopped: Fn();
}
