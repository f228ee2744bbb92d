//! Capture filter construction.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::config::dto::CaptureConf;
use crate::rooms::ExpandedRooms;

/// Filter matching no packet at all.
pub const MATCH_NOTHING: &str = "ip and not ip";

const TCP_SYN_ONLY: &str = "tcp[tcpflags] & (tcp-syn|tcp-ack) == tcp-syn";

/// QUIC long header, packet type Initial.
const QUIC_INITIAL: &str = "udp dst port 443 and udp[8] & 0xf0 == 0xc0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// New TCP connections and QUIC handshakes only
    Lightweight,
    /// TCP to the given ports, any QUIC, and any SYN
    Verbose { ports: Vec<u16> },
}

impl CaptureMode {
    pub fn from_conf(conf: &CaptureConf) -> Self {
        if conf.syn_only {
            Self::Lightweight
        } else {
            Self::Verbose {
                ports: conf.ports.clone(),
            }
        }
    }
}

enum Target {
    Host(Ipv4Addr),
    Segment([u8; 3]),
}

impl Target {
    fn clause(&self, direction: &str) -> String {
        let prefix = if direction.is_empty() {
            String::new()
        } else {
            format!("{direction} ")
        };

        match self {
            Target::Host(addr) => format!("{prefix}host {addr}"),
            Target::Segment([a, b, c]) => format!("{prefix}net {a}.{b}.{c}.0/24"),
        }
    }
}

/// Builds the capture filter for the monitored hosts.
///
/// DNS is captured in both directions; everything else only as egress from a monitored host.
pub fn build_filter(rooms: &ExpandedRooms, mode: &CaptureMode) -> String {
    let targets = collapse_segments(rooms);

    if targets.is_empty() {
        return MATCH_NOTHING.to_owned();
    }

    let any_direction = join_or(targets.iter().map(|target| target.clause("")));
    let egress = join_or(targets.iter().map(|target| target.clause("src")));

    let dns = format!("(port 53 and ({any_direction}))");

    let traffic = match mode {
        CaptureMode::Lightweight => format!("({TCP_SYN_ONLY}) or ({QUIC_INITIAL})"),
        CaptureMode::Verbose { ports } => {
            let mut alternatives = Vec::new();

            if !ports.is_empty() {
                alternatives.push(format!(
                    "(tcp and ({}))",
                    join_or(ports.iter().map(|port| format!("dst port {port}")))
                ));
            }

            alternatives.push("(udp dst port 443)".to_owned());
            alternatives.push(format!("({TCP_SYN_ONLY})"));

            join_or(alternatives.into_iter())
        }
    };

    format!("{dns} or (({egress}) and ({traffic}))")
}

/// Groups hosts by /24; a segment with all of `.1`–`.254` becomes a single `net` clause.
fn collapse_segments(rooms: &ExpandedRooms) -> Vec<Target> {
    let mut segments: BTreeMap<[u8; 3], Vec<Ipv4Addr>> = BTreeMap::new();

    for host in rooms.hosts() {
        let [a, b, c, _] = host.octets();
        segments.entry([a, b, c]).or_default().push(host);
    }

    let mut targets = Vec::new();

    for (segment, hosts) in segments {
        let full = hosts.iter().filter(|host| (1..=254).contains(&host.octets()[3])).count() == 254;

        if full {
            // Also covers .0 and .255 if a /31 or /32 entry added them.
            targets.push(Target::Segment(segment));
        } else {
            targets.extend(hosts.into_iter().map(Target::Host));
        }
    }

    targets
}

fn join_or(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(" or ")
}
