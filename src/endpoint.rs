//! Local and remote endpoint descriptions.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Where a connection or listener lives on this host.
///
/// Any combination of interfaces, addresses and a host name may be given;
/// a listener uses all of them, an outgoing connection only binds to
/// addresses found on the given interfaces (or given explicitly).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalEndpoint {
    interfaces: Vec<String>,
    addresses: Vec<IpAddr>,
    host_name: Option<String>,
    port: Option<u16>,
}

impl LocalEndpoint {
    /// An endpoint that leaves every choice to the operating system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a network interface, by name (`eth0`) or by address (`127.0.0.1`).
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Pin a local address.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.addresses.push(address);
        self
    }

    /// Listen on the addresses a host name resolves to.
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Set the local port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Pinned interfaces.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Pinned addresses.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Host name to resolve, if any.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// The local port, `0` when unset.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    /// Whether the endpoint constrains local addresses at all.
    pub fn is_pinned(&self) -> bool {
        !self.interfaces.is_empty() || !self.addresses.is_empty()
    }
}

/// The peer of a connection.
///
/// A host name takes precedence over literal addresses: when it is set, the
/// addresses are filled in from resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEndpoint {
    host_name: Option<String>,
    addresses: Vec<IpAddr>,
    port: Option<u16>,
}

impl RemoteEndpoint {
    /// An empty remote endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host name to resolve.
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Add a literal remote address.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.addresses.push(address);
        self
    }

    /// Set the remote port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The host name, if any.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// Literal addresses.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// The remote port, `0` when unset.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    /// The single peer address, if exactly one is known.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.addresses.as_slice() {
            [addr] => Some(SocketAddr::new(*addr, self.port())),
            _ => None,
        }
    }
}

impl From<SocketAddr> for RemoteEndpoint {
    fn from(addr: SocketAddr) -> Self {
        RemoteEndpoint::new()
            .with_address(addr.ip())
            .with_port(addr.port())
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host_name, self.addresses.as_slice()) {
            (Some(host), _) => write!(f, "{host}:{}", self.port()),
            (None, [addr]) => write!(f, "{}", SocketAddr::new(*addr, self.port())),
            (None, addrs) => write!(f, "{addrs:?}:{}", self.port()),
        }
    }
}
