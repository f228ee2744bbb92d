//! Monitored hosts and the room they belong to.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr as _;

use ipnetwork::Ipv4Network;

/// Room assigned to sources absent from the policy.
pub const UNKNOWN_ROOM: &str = "unknown";

/// Narrowest range accepted as a policy entry.
const MIN_PREFIX: u8 = 24;

/// Raw room policy, as found in the configuration.
///
/// Keys are an IPv4 host, a CIDR between `/24` and `/32`, or a legacy `a.b.c.0` meaning the whole `/24`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPolicy {
    entries: BTreeMap<String, String>,
}

impl RoomPolicy {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Expands every entry into concrete host addresses.
    ///
    /// Single-host entries always win over ranges covering the same address.
    pub fn expand(&self) -> ExpandedRooms {
        let mut ranges = Vec::new();
        let mut singles = Vec::new();

        for (key, room) in &self.entries {
            match parse_entry(key.trim()) {
                Some(PolicyEntry::Host(addr)) => singles.push((addr, room)),
                Some(PolicyEntry::Range(network)) => ranges.push((network, room)),
                None => warn!(entry = %key, %room, "Ignored room policy entry"),
            }
        }

        let mut hosts = BTreeMap::new();

        for (network, room) in ranges {
            for addr in range_hosts(network) {
                hosts.insert(addr, room.clone());
            }
        }

        for (addr, room) in singles {
            hosts.insert(addr, room.clone());
        }

        ExpandedRooms { hosts }
    }
}

impl FromIterator<(String, String)> for RoomPolicy {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

enum PolicyEntry {
    Host(Ipv4Addr),
    Range(Ipv4Network),
}

fn parse_entry(key: &str) -> Option<PolicyEntry> {
    if key.contains('/') {
        let network = Ipv4Network::from_str(key).ok()?;

        return match network.prefix() {
            32 => Some(PolicyEntry::Host(network.ip())),
            prefix if prefix >= MIN_PREFIX => Some(PolicyEntry::Range(network)),
            _ => None,
        };
    }

    let addr = Ipv4Addr::from_str(key).ok()?;

    if addr.octets()[3] == 0 {
        // Legacy notation for the whole segment.
        Ipv4Network::new(addr, 24).ok().map(PolicyEntry::Range)
    } else {
        Some(PolicyEntry::Host(addr))
    }
}

/// Usable host addresses of a range: network and broadcast addresses are excluded, except for `/31`.
fn range_hosts(network: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let first = u32::from(network.network());
    let last = u32::from(network.broadcast());

    let (start, end) = if network.prefix() >= 31 { (first, last) } else { (first + 1, last - 1) };

    (start..=end).map(Ipv4Addr::from)
}

/// Concrete host → room mapping produced by [`RoomPolicy::expand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedRooms {
    hosts: BTreeMap<Ipv4Addr, String>,
}

impl ExpandedRooms {
    pub fn room_of(&self, ip: IpAddr) -> Option<&str> {
        match ip {
            IpAddr::V4(ip) => self.hosts.get(&ip).map(String::as_str),
            IpAddr::V6(ip) => ip.to_ipv4_mapped().and_then(|ip| self.hosts.get(&ip)).map(String::as_str),
        }
    }

    /// Room of the given source, or [`UNKNOWN_ROOM`].
    pub fn room_or_unknown(&self, ip: IpAddr) -> &str {
        self.room_of(ip).unwrap_or(UNKNOWN_ROOM)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.hosts.keys().copied()
    }
}
