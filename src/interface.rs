//! Local interface address enumeration.

use std::io;
use std::net::{IpAddr, Ipv6Addr};

use crate::dns::IpAddrs;

/// Whether an IPv6 address is link-local (`fe80::/10`).
///
/// Link-local addresses need a scope id to be usable, which interface
/// enumeration does not carry through to socket binding, so they are
/// never offered as local candidates.
pub fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Addresses usable on an interface.
///
/// The interface may be given by name (`lo`, `eth0`) or as a literal address,
/// in which case that address is the only one returned.
pub fn interface_addrs(interface: &str) -> io::Result<IpAddrs> {
    if let Ok(addr) = interface.parse::<IpAddr>() {
        return Ok(IpAddrs::from_iter([addr]));
    }

    let addrs: IpAddrs = enumerate(interface)?
        .into_iter()
        .filter(|addr| match addr {
            IpAddr::V6(v6) => !is_link_local_v6(v6),
            IpAddr::V4(_) => true,
        })
        .collect();

    tracing::trace!(%interface, %addrs, "interface addresses");

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable addresses on interface {interface}"),
        ));
    }

    Ok(addrs)
}

/// Addresses on all of the given interfaces.
pub fn interfaces_addrs<'a, I>(interfaces: I) -> io::Result<IpAddrs>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut addrs = IpAddrs::new();
    for interface in interfaces {
        addrs.extend(interface_addrs(interface)?.iter());
    }
    Ok(addrs)
}

/// Index of a named interface, used to join IPv6 multicast groups.
pub(crate) fn interface_index(interface: &str) -> io::Result<u32> {
    #[cfg(unix)]
    {
        nix::net::if_::if_nametoindex(interface).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    {
        let _ = interface;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface lookup is not supported on this platform",
        ))
    }
}

#[cfg(unix)]
fn enumerate(interface: &str) -> io::Result<Vec<IpAddr>> {
    use std::net::{SocketAddrV4, SocketAddrV6};

    let mut found = false;
    let mut addrs = Vec::new();
    for entry in nix::ifaddrs::getifaddrs().map_err(io::Error::from)? {
        if entry.interface_name != interface {
            continue;
        }
        found = true;

        let Some(address) = entry.address else {
            continue;
        };

        if let Some(sin) = address.as_sockaddr_in() {
            addrs.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
        }
    }

    if !found {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown interface {interface}"),
        ));
    }

    Ok(addrs)
}

#[cfg(not(unix))]
fn enumerate(interface: &str) -> io::Result<Vec<IpAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot enumerate addresses of {interface} on this platform"),
    ))
}
