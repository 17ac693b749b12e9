//! Multicast group membership for receive-only datagram endpoints.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::endpoint::LocalEndpoint;
use crate::interface::{interface_addrs, interface_index};

/// A joined group. Leaving is explicit; dropping the socket also drops the
/// membership.
#[derive(Debug)]
pub(crate) struct MulticastMembership {
    socket: Arc<UdpSocket>,
    group: Group,
}

#[derive(Debug, Clone, Copy)]
enum Group {
    V4 { group: Ipv4Addr, interface: Ipv4Addr },
    V6 { group: Ipv6Addr, interface: u32 },
}

impl MulticastMembership {
    /// Join `group` on `socket`, using the first interface (or IPv4 address)
    /// of `local` to pick the network. Without one the system chooses.
    pub(crate) fn join(
        socket: Arc<UdpSocket>,
        group: IpAddr,
        local: &LocalEndpoint,
    ) -> io::Result<Self> {
        let group = match group {
            IpAddr::V4(group) => {
                let interface = v4_interface(local)?;
                socket.join_multicast_v4(group, interface)?;
                Group::V4 { group, interface }
            }
            IpAddr::V6(group) => {
                let interface = match local.interfaces().first() {
                    Some(name) => interface_index(name)?,
                    None => 0,
                };
                socket.join_multicast_v6(&group, interface)?;
                Group::V6 { group, interface }
            }
        };

        tracing::debug!(?group, "joined multicast group");
        Ok(Self { socket, group })
    }

    /// Leave the group.
    pub(crate) fn leave(self) -> io::Result<()> {
        match self.group {
            Group::V4 { group, interface } => self.socket.leave_multicast_v4(group, interface)?,
            Group::V6 { group, interface } => self.socket.leave_multicast_v6(&group, interface)?,
        }
        tracing::debug!(group = ?self.group, "left multicast group");
        Ok(())
    }
}

/// The address to bind a receiver of `group` on `port` to.
///
/// Binding to the group itself filters out unicast traffic to the same port
/// on platforms which allow it.
pub(crate) fn bind_addr(group: IpAddr, port: u16) -> SocketAddr {
    if cfg!(unix) {
        SocketAddr::new(group, port)
    } else {
        SocketAddr::new(crate::candidate::unspecified_for(&group), port)
    }
}

fn v4_interface(local: &LocalEndpoint) -> io::Result<Ipv4Addr> {
    let explicit = local.addresses().iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_multicast() => Some(*v4),
        _ => None,
    });
    if let Some(addr) = explicit {
        return Ok(addr);
    }

    if let Some(name) = local.interfaces().first() {
        if let Some(IpAddr::V4(addr)) = interface_addrs(name)?.v4().first() {
            return Ok(*addr);
        }
    }

    Ok(Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_from_local_endpoint() {
        let local = LocalEndpoint::new().with_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(v4_interface(&local).unwrap(), Ipv4Addr::LOCALHOST);

        let group = LocalEndpoint::new().with_address(IpAddr::V4(Ipv4Addr::new(239, 1, 2, 3)));
        assert_eq!(v4_interface(&group).unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            v4_interface(&LocalEndpoint::new()).unwrap(),
            Ipv4Addr::UNSPECIFIED
        );
    }

    #[test]
    fn receivers_bind_the_group_port() {
        let group = IpAddr::V4(Ipv4Addr::new(239, 255, 77, 1));
        assert_eq!(bind_addr(group, 5000).port(), 5000);
        if cfg!(unix) {
            assert_eq!(bind_addr(group, 5000).ip(), group);
        }
    }
}
