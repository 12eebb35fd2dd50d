//! Endpoint and snapshot primitives shared by both agents.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a forwarded endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream sockets.
    Tcp,
    /// Datagram sockets.
    Udp,
}

impl Protocol {
    /// Returns the lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::error::VmbridgeError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "tcp" | "tcp4" | "tcp6" => Ok(Self::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Self::Udp),
            other => Err(crate::error::VmbridgeError::config(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// A locally-bound (IP, port, protocol) triple.
///
/// Equality is structural. The [`fmt::Display`] form is stable and is used
/// as a map key wherever per-endpoint bookkeeping is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    /// Bound IP address.
    pub ip: IpAddr,
    /// Bound port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl IpPort {
    /// Creates a new endpoint.
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self { ip, port, protocol }
    }

    /// Creates a TCP endpoint on the IPv4 unspecified address.
    #[must_use]
    pub const fn tcp_any(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port, Protocol::Tcp)
    }

    /// Returns true when the bound address is the unspecified address of
    /// either family.
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// Returns the `host:port` form, bracketing IPv6 addresses.
    #[must_use]
    pub fn host_port(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{ip}:{}", self.port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.port),
        }
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host_port())
    }
}

/// The set of endpoints visible to the guest scanner at one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSnapshot {
    /// Listening endpoints, order-insensitive.
    pub ports: Vec<IpPort>,
}

impl PortSnapshot {
    /// Creates a snapshot from a list of endpoints, dropping duplicates.
    #[must_use]
    pub fn new(ports: Vec<IpPort>) -> Self {
        let mut seen = HashSet::new();
        let ports = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        Self { ports }
    }

    /// Returns true when no endpoint is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// The difference between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDelta {
    /// Endpoints present in the new snapshot but not the old one.
    pub added: Vec<IpPort>,
    /// Endpoints present in the old snapshot but not the new one.
    pub removed: Vec<IpPort>,
}

impl PortDelta {
    /// Returns true when nothing was added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes `added = new ∖ old` and `removed = old ∖ new`.
///
/// Comparing a snapshot with itself yields an empty delta, and the two
/// result sets are always disjoint.
#[must_use]
pub fn compare_ports(old: &PortSnapshot, new: &PortSnapshot) -> PortDelta {
    let old_set: HashSet<IpPort> = old.ports.iter().copied().collect();
    let new_set: HashSet<IpPort> = new.ports.iter().copied().collect();

    let added = new.ports.iter().filter(|p| !old_set.contains(p)).copied().collect();
    let removed = old.ports.iter().filter(|p| !new_set.contains(p)).copied().collect();
    PortDelta { added, removed }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn ep(ip: &str, port: u16, protocol: Protocol) -> IpPort {
        IpPort::new(ip.parse().unwrap(), port, protocol)
    }

    #[test]
    fn display_is_stable_map_key() {
        let e = ep("127.0.0.1", 8080, Protocol::Tcp);
        assert_eq!(e.to_string(), "tcp://127.0.0.1:8080");

        let e6 = ep("::1", 53, Protocol::Udp);
        assert_eq!(e6.to_string(), "udp://[::1]:53");
    }

    #[test]
    fn compare_identical_snapshots_is_empty() {
        let snap = PortSnapshot::new(vec![
            ep("0.0.0.0", 80, Protocol::Tcp),
            ep("::", 443, Protocol::Tcp),
        ]);
        let delta = compare_ports(&snap, &snap);
        assert!(delta.is_empty());
    }

    #[test]
    fn compare_disjoint_results() {
        let old = PortSnapshot::new(vec![
            ep("0.0.0.0", 80, Protocol::Tcp),
            ep("0.0.0.0", 81, Protocol::Tcp),
        ]);
        let new = PortSnapshot::new(vec![
            ep("0.0.0.0", 81, Protocol::Tcp),
            ep("0.0.0.0", 82, Protocol::Tcp),
        ]);

        let delta = compare_ports(&old, &new);
        assert_eq!(delta.added, vec![ep("0.0.0.0", 82, Protocol::Tcp)]);
        assert_eq!(delta.removed, vec![ep("0.0.0.0", 80, Protocol::Tcp)]);

        let added: HashSet<_> = delta.added.iter().collect();
        let removed: HashSet<_> = delta.removed.iter().collect();
        assert!(added.is_disjoint(&removed));
    }

    #[test]
    fn same_port_different_protocol_is_distinct() {
        let old = PortSnapshot::new(vec![ep("0.0.0.0", 53, Protocol::Tcp)]);
        let new = PortSnapshot::new(vec![ep("0.0.0.0", 53, Protocol::Udp)]);
        let delta = compare_ports(&old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
    }

    #[test]
    fn snapshot_deduplicates() {
        let snap = PortSnapshot::new(vec![
            ep("127.0.0.1", 22, Protocol::Tcp),
            ep("127.0.0.1", 22, Protocol::Tcp),
        ]);
        assert_eq!(snap.ports.len(), 1);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let snap = PortSnapshot::new(vec![
            ep("0.0.0.0", 8080, Protocol::Tcp),
            ep("fe80::1", 1900, Protocol::Udp),
        ]);
        let json = serde_json::to_string(&snap).unwrap();
        let back: PortSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
