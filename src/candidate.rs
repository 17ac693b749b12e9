//! Candidate selection.
//!
//! [`rank`] turns transport properties into an ordered list of protocols, and
//! [`candidate_set`] crosses those protocols with resolved addresses into the
//! [`Candidate`]s the racer attempts in order.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::dns::IpAddrs;
use crate::properties::{PreferenceLevel, Protocol, ProtocolTable, TransportProperties};

/// Rank the protocols in `table` against the application's preferences.
///
/// Protocols lacking a required property or providing a prohibited one are
/// removed. The rest are sorted by how many preferred properties they provide
/// and then by how few avoided properties they provide. The sort is stable, so
/// ties keep the table's declaration order.
///
/// An empty result means no protocol can satisfy the properties.
pub fn rank(properties: &TransportProperties, table: &ProtocolTable) -> Vec<Protocol> {
    let mut scored: Vec<(Protocol, i32, i32)> = Vec::with_capacity(table.len());

    'protocols: for row in table {
        let mut prefer = 0;
        let mut avoid = 0;

        for (property, level) in properties.iter() {
            let provided = row.provides(property);
            match level {
                PreferenceLevel::Prohibit if provided => continue 'protocols,
                PreferenceLevel::Require if !provided => continue 'protocols,
                PreferenceLevel::Prefer if provided => prefer += 1,
                PreferenceLevel::Avoid if provided => avoid -= 1,
                _ => {}
            }
        }

        scored.push((row.protocol(), prefer, avoid));
    }

    scored.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));
    scored.into_iter().map(|(protocol, _, _)| protocol).collect()
}

/// One (protocol, remote address, local address) combination to attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    protocol: Protocol,
    remote: SocketAddr,
    local: Option<SocketAddr>,
}

impl Candidate {
    /// Create a candidate.
    pub fn new(protocol: Protocol, remote: SocketAddr, local: Option<SocketAddr>) -> Self {
        Self {
            protocol,
            remote,
            local,
        }
    }

    /// The protocol to use.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The remote address to connect to.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The local address to bind, if one is pinned.
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "{} {} -> {}", self.protocol, local, self.remote),
            None => write!(f, "{} -> {}", self.protocol, self.remote),
        }
    }
}

/// Build the ordered candidate set.
///
/// Remote addresses are the outer loop (IPv6 before IPv4), ranked protocols
/// the middle one. When local addresses are pinned, each pair is further
/// crossed with every local address of the same family; a remote address
/// with no local address of its family yields no candidates.
pub fn candidate_set(
    protocols: &[Protocol],
    remotes: &IpAddrs,
    remote_port: u16,
    locals: Option<&IpAddrs>,
    local_port: u16,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for remote in remotes.iter() {
        let remote = SocketAddr::new(remote, remote_port);
        for protocol in protocols {
            match locals {
                Some(locals) => {
                    for local in locals.same_family(&remote.ip()) {
                        candidates.push(Candidate::new(
                            *protocol,
                            remote,
                            Some(SocketAddr::new(local, local_port)),
                        ));
                    }
                }
                None => candidates.push(Candidate::new(*protocol, remote, None)),
            }
        }
    }

    candidates
}

pub(crate) fn unspecified_for(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::properties::{Property, ProtocolDescriptor};

    fn table() -> ProtocolTable {
        ProtocolTable::new([
            ProtocolDescriptor::new(Protocol::Tcp).with(Property::Reliability, true),
            ProtocolDescriptor::new(Protocol::Udp).with(Property::Reliability, false),
        ])
    }

    #[test]
    fn require_reliability_selects_tcp() {
        let props = TransportProperties::new().require(Property::Reliability);
        assert_eq!(rank(&props, &table()), vec![Protocol::Tcp]);
    }

    #[test]
    fn empty_properties_keep_table_order() {
        let props = TransportProperties::new();
        assert_eq!(rank(&props, &table()), vec![Protocol::Tcp, Protocol::Udp]);
    }

    #[test]
    fn prohibit_reliability_selects_udp() {
        let props = TransportProperties::new().prohibit(Property::Reliability);
        assert_eq!(rank(&props, &table()), vec![Protocol::Udp]);
    }

    #[test]
    fn conflicting_properties_eliminate_everything() {
        let props = TransportProperties::new()
            .require(Property::Reliability)
            .require(Property::PreserveMsgBoundaries);
        assert!(rank(&props, &ProtocolTable::default()).is_empty());
    }

    #[test]
    fn prefer_moves_protocol_forward() {
        let props = TransportProperties::new().prefer(Property::PreserveMsgBoundaries);
        assert_eq!(
            rank(&props, &ProtocolTable::default()),
            vec![Protocol::Udp, Protocol::Tcp]
        );
    }

    #[test]
    fn avoid_moves_protocol_back() {
        let props = TransportProperties::new().avoid(Property::Reliability);
        assert_eq!(rank(&props, &table()), vec![Protocol::Udp, Protocol::Tcp]);
    }

    #[test]
    fn prefer_outweighs_avoid() {
        // TCP: prefer +1, avoid -1. UDP: prefer 0, avoid 0.
        let props = TransportProperties::new()
            .prefer(Property::Reliability)
            .avoid(Property::CongestionControl);
        assert_eq!(
            rank(&props, &ProtocolTable::default()),
            vec![Protocol::Tcp, Protocol::Udp]
        );
    }

    #[test]
    fn ranking_never_violates_hard_constraints() {
        let table = ProtocolTable::default();
        let properties = [
            Property::Reliability,
            Property::PreserveMsgBoundaries,
            Property::PreserveOrder,
            Property::CongestionControl,
            Property::ZeroRttMsg,
        ];
        let levels = [
            PreferenceLevel::Require,
            PreferenceLevel::Prefer,
            PreferenceLevel::Avoid,
            PreferenceLevel::Prohibit,
        ];

        for (i, first) in properties.iter().enumerate() {
            for second in &properties[i + 1..] {
                for a in levels {
                    for b in levels {
                        let mut props = TransportProperties::new();
                        props.add(*first, a);
                        props.add(*second, b);

                        let ranked = rank(&props, &table);
                        for protocol in &ranked {
                            let row = table.iter().find(|r| r.protocol() == *protocol).unwrap();
                            for (property, level) in props.iter() {
                                match level {
                                    PreferenceLevel::Require => assert!(row.provides(property)),
                                    PreferenceLevel::Prohibit => assert!(!row.provides(property)),
                                    _ => {}
                                }
                            }
                        }

                        let only_hard = props.iter().all(|(_, level)| {
                            matches!(level, PreferenceLevel::Require | PreferenceLevel::Prohibit)
                        });
                        if only_hard {
                            let declared: Vec<_> = table
                                .iter()
                                .map(|r| r.protocol())
                                .filter(|p| ranked.contains(p))
                                .collect();
                            assert_eq!(ranked, declared);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn candidates_are_address_major() {
        let remotes = IpAddrs::from_iter([
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ]);
        let set = candidate_set(&[Protocol::Tcp, Protocol::Udp], &remotes, 443, None, 0);

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 443);
        assert_eq!(
            set,
            vec![
                Candidate::new(Protocol::Tcp, v6, None),
                Candidate::new(Protocol::Udp, v6, None),
                Candidate::new(Protocol::Tcp, v4, None),
                Candidate::new(Protocol::Udp, v4, None),
            ]
        );
    }

    #[test]
    fn pinned_locals_match_family() {
        let remotes = IpAddrs::from_iter([
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ]);
        let locals = IpAddrs::from_iter([IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);

        let set = candidate_set(&[Protocol::Tcp], &remotes, 80, Some(&locals), 0);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].remote().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            set[0].local(),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 0))
        );
    }

    #[test]
    fn no_protocols_no_candidates() {
        let remotes = IpAddrs::from_iter([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert!(candidate_set(&[], &remotes, 80, None, 0).is_empty());
    }
}
