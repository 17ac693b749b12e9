//! Transport properties and the protocol capability table.
//!
//! Applications do not name a protocol. They attach a [`PreferenceLevel`] to
//! abstract [`Property`]s, and candidate selection compares them against the
//! capabilities each protocol declares in a [`ProtocolTable`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How strongly a transport property is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceLevel {
    /// Protocols without the property are removed.
    Require,

    /// Protocols with the property are ranked higher.
    Prefer,

    /// Protocols with the property are ranked lower.
    Avoid,

    /// Protocols with the property are removed.
    Prohibit,
}

/// Selection properties a protocol may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Property {
    /// Reliable data transfer: every byte arrives, or the connection fails.
    Reliability,

    /// Message boundaries are preserved by the transport itself.
    PreserveMsgBoundaries,

    /// Data is delivered in the order it was sent.
    PreserveOrder,

    /// The transport runs congestion control.
    CongestionControl,

    /// Reliability can be configured per message.
    PerMsgReliability,

    /// Several independent streams share one connection.
    Multistreaming,

    /// Data can be sent before the handshake completes.
    ZeroRttMsg,
}

impl Property {
    /// The property name as used in the Transport Services interface.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reliability => "reliability",
            Self::PreserveMsgBoundaries => "preserve-msg-boundaries",
            Self::PreserveOrder => "preserve-order",
            Self::CongestionControl => "congestion-control",
            Self::PerMsgReliability => "per-msg-reliability",
            Self::Multistreaming => "multistreaming",
            Self::ZeroRttMsg => "zero-rtt-msg",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of communication for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Both sides send and receive.
    #[default]
    Bidirectional,

    /// This side only sends.
    UnidirectionalSend,

    /// This side only receives. Required to listen on a multicast group.
    UnidirectionalReceive,
}

/// A transport protocol the library knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// TCP, a reliable byte stream (optionally wrapped in TLS).
    Tcp,

    /// UDP, unreliable datagrams.
    Udp,
}

impl Protocol {
    /// Lowercase protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Whether the protocol preserves message boundaries on its own.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown protocol name.
#[derive(Debug, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// The set of preferences an application attaches to a connection.
///
/// Preferences keep the order in which they were first added. Adding a
/// property again replaces its level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportProperties {
    preferences: Vec<(Property, PreferenceLevel)>,
    direction: Direction,
}

impl TransportProperties {
    /// Empty properties: every known protocol is a candidate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the preference level for a property.
    pub fn add(&mut self, property: Property, level: PreferenceLevel) -> &mut Self {
        match self.preferences.iter_mut().find(|(p, _)| *p == property) {
            Some(entry) => entry.1 = level,
            None => self.preferences.push((property, level)),
        }
        self
    }

    /// Remove a preference, returning its previous level.
    pub fn remove(&mut self, property: Property) -> Option<PreferenceLevel> {
        let index = self.preferences.iter().position(|(p, _)| *p == property)?;
        Some(self.preferences.remove(index).1)
    }

    /// Builder style [`add`][Self::add] with [`PreferenceLevel::Require`].
    pub fn require(mut self, property: Property) -> Self {
        self.add(property, PreferenceLevel::Require);
        self
    }

    /// Builder style [`add`][Self::add] with [`PreferenceLevel::Prefer`].
    pub fn prefer(mut self, property: Property) -> Self {
        self.add(property, PreferenceLevel::Prefer);
        self
    }

    /// Builder style [`add`][Self::add] with [`PreferenceLevel::Avoid`].
    pub fn avoid(mut self, property: Property) -> Self {
        self.add(property, PreferenceLevel::Avoid);
        self
    }

    /// Builder style [`add`][Self::add] with [`PreferenceLevel::Prohibit`].
    pub fn prohibit(mut self, property: Property) -> Self {
        self.add(property, PreferenceLevel::Prohibit);
        self
    }

    /// The level set for a property, if any.
    pub fn get(&self, property: Property) -> Option<PreferenceLevel> {
        self.preferences
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, level)| *level)
    }

    /// Iterate over the declared preferences in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Property, PreferenceLevel)> + '_ {
        self.preferences.iter().copied()
    }

    /// The communication direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Set the communication direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Static capability record for one protocol.
///
/// A capability that is not listed counts as not provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    protocol: Protocol,
    capabilities: BTreeMap<Property, bool>,
}

impl ProtocolDescriptor {
    /// A descriptor with no capabilities.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            capabilities: BTreeMap::new(),
        }
    }

    /// Declare whether the protocol provides a property.
    pub fn with(mut self, property: Property, provided: bool) -> Self {
        self.capabilities.insert(property, provided);
        self
    }

    /// The protocol described.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the protocol provides a property.
    pub fn provides(&self, property: Property) -> bool {
        self.capabilities.get(&property).copied().unwrap_or(false)
    }

    /// The TCP row of the default table.
    pub fn tcp() -> Self {
        Self::new(Protocol::Tcp)
            .with(Property::Reliability, true)
            .with(Property::PreserveMsgBoundaries, false)
            .with(Property::PreserveOrder, true)
            .with(Property::CongestionControl, true)
            .with(Property::PerMsgReliability, false)
            .with(Property::Multistreaming, false)
            .with(Property::ZeroRttMsg, false)
    }

    /// The UDP row of the default table.
    pub fn udp() -> Self {
        Self::new(Protocol::Udp)
            .with(Property::Reliability, false)
            .with(Property::PreserveMsgBoundaries, true)
            .with(Property::PreserveOrder, false)
            .with(Property::CongestionControl, false)
            .with(Property::PerMsgReliability, false)
            .with(Property::Multistreaming, false)
            .with(Property::ZeroRttMsg, true)
    }
}

/// The protocols known to the implementation, in declaration order.
///
/// Declaration order breaks ties when ranking candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTable {
    rows: Vec<ProtocolDescriptor>,
}

impl ProtocolTable {
    /// Build a table from descriptors.
    pub fn new(rows: impl IntoIterator<Item = ProtocolDescriptor>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
        }
    }

    /// Iterate over descriptors in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, ProtocolDescriptor> {
        self.rows.iter()
    }

    /// Number of protocols in the table.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::new([ProtocolDescriptor::tcp(), ProtocolDescriptor::udp()])
    }
}

impl<'a> IntoIterator for &'a ProtocolTable {
    type Item = &'a ProtocolDescriptor;
    type IntoIter = std::slice::Iter<'a, ProtocolDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_twice_replaces_level() {
        let mut props = TransportProperties::new();
        props.add(Property::Reliability, PreferenceLevel::Prefer);
        props.add(Property::PreserveOrder, PreferenceLevel::Avoid);
        props.add(Property::Reliability, PreferenceLevel::Require);

        let entries: Vec<_> = props.iter().collect();
        assert_eq!(
            entries,
            vec![
                (Property::Reliability, PreferenceLevel::Require),
                (Property::PreserveOrder, PreferenceLevel::Avoid),
            ]
        );

        assert_eq!(props.remove(Property::PreserveOrder), Some(PreferenceLevel::Avoid));
        assert_eq!(props.get(Property::PreserveOrder), None);
    }

    #[test]
    fn default_table_distinguishes_stream_and_datagram() {
        let table = ProtocolTable::default();
        let rows: Vec<_> = table.iter().map(|row| row.protocol()).collect();
        assert_eq!(rows, vec![Protocol::Tcp, Protocol::Udp]);

        assert!(ProtocolDescriptor::tcp().provides(Property::Reliability));
        assert!(!ProtocolDescriptor::udp().provides(Property::Reliability));
    }

    #[test]
    fn unlisted_capability_is_not_provided() {
        let row = ProtocolDescriptor::new(Protocol::Tcp);
        assert!(!row.provides(Property::Multistreaming));
    }

    #[test]
    fn protocol_names_round_trip() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
