//! Tapsdriver
//!
//! Transport Services for Tokio: describe the transport you want with
//! properties, and let the library pick, race and connect the protocol.
//!
//! Applications build a [`Preconnection`] from endpoints and
//! [`TransportProperties`], then either [`initiate`][Preconnection::initiate]
//! an outgoing [`Connection`] or [`listen`][Preconnection::listen] for incoming
//! ones. Every connection exposes the same message oriented send/receive API,
//! whether it runs over a TCP (optionally TLS) byte stream or a UDP datagram
//! socket. Outcomes are reported through the optional event handlers in
//! [`events`].
//!
//! ```no_run
//! use tapsdriver::{Preconnection, PreferenceLevel, Property, RemoteEndpoint, TransportProperties};
//!
//! # async fn run() {
//! let mut properties = TransportProperties::new();
//! properties.add(Property::Reliability, PreferenceLevel::Require);
//!
//! let preconnection = Preconnection::new()
//!     .with_remote_endpoint(RemoteEndpoint::new().with_host_name("example.com").with_port(80))
//!     .with_transport_properties(properties)
//!     .on_ready(|connection| {
//!         connection.send(&b"hello"[..]);
//!     });
//!
//! let connection = preconnection.initiate();
//! # let _ = connection;
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod candidate;
pub mod config;
pub mod connection;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod framer;
pub mod interface;
pub mod listener;
pub mod message;
mod multicast;
pub mod preconnection;
pub mod properties;
pub(crate) mod race;
pub mod security;
pub(crate) mod session;
pub(crate) mod socket;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use dns::Resolver;
pub use endpoint::{LocalEndpoint, RemoteEndpoint};
pub use error::Error;
pub use framer::Framer;
pub use listener::Listener;
pub use message::{MessageContext, ReceiveRequest};
pub use preconnection::Preconnection;
pub use properties::{
    Direction, PreferenceLevel, Property, Protocol, ProtocolDescriptor, ProtocolTable,
    TransportProperties,
};
pub use security::{SecurityContext, SecurityParameters};

/// Boxed, type-erased error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
