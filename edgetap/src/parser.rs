//! Turns one line of the capture helper into a [`TrafficEvent`].

use std::net::IpAddr;

use time::UtcOffset;

use crate::classifier::DomainServiceClassifier;
use crate::dns_cache::{DnsCache, normalize_domain};
use crate::event::{TrafficEvent, epoch_to_datetime, event_id, format_display_time};
use crate::ptr::PtrSubmitter;
use crate::rooms::ExpandedRooms;
use crate::threat::ThreatIntel;

/// Field list requested from the helper, in output order.
pub const FIELDS: [&str; 14] = [
    "frame.time_epoch",
    "ip.src",
    "ip.dst",
    "tcp.dstport",
    "udp.dstport",
    "ip.proto",
    "dns.qry.name",
    "dns.a",
    "dns.aaaa",
    "dns.cname",
    "http.host",
    "http.request.uri",
    "tls.handshake.extensions_server_name",
    "gquic.tag.sni",
];

pub const SEPARATOR: char = '|';

/// Borrowed view over the fields of a line; multi-valued fields are comma separated.
#[derive(Debug, Clone, Copy)]
pub struct RawFields<'a> {
    pub epoch: &'a str,
    pub src_ip: &'a str,
    pub dst_ip: &'a str,
    pub tcp_dst_port: &'a str,
    pub udp_dst_port: &'a str,
    pub ip_proto: &'a str,
    pub dns_query: &'a str,
    pub dns_a: &'a str,
    pub dns_aaaa: &'a str,
    pub dns_cname: &'a str,
    pub http_host: &'a str,
    pub http_uri: &'a str,
    pub tls_sni: &'a str,
    pub quic_sni: &'a str,
}

impl<'a> RawFields<'a> {
    pub fn split(line: &'a str) -> Option<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(SEPARATOR);
        let mut next = || fields.next();

        Some(Self {
            epoch: next()?,
            src_ip: next()?,
            dst_ip: next()?,
            tcp_dst_port: next()?,
            udp_dst_port: next()?,
            ip_proto: next()?,
            dns_query: next()?,
            dns_a: next()?,
            dns_aaaa: next()?,
            dns_cname: next()?,
            http_host: next()?,
            http_uri: next()?,
            tls_sni: next()?,
            quic_sni: next()?,
        })
    }

    fn has_dns(&self) -> bool {
        [self.dns_query, self.dns_a, self.dns_aaaa, self.dns_cname]
            .iter()
            .any(|field| !field.trim().is_empty())
    }
}

/// First value of a possibly multi-valued field.
fn first(field: &str) -> Option<&str> {
    field.split(',').map(str::trim).find(|value| !value.is_empty())
}

fn last(field: &str) -> Option<&str> {
    field.rsplit(',').map(str::trim).find(|value| !value.is_empty())
}

/// `Host` header without its port.
fn host_domain(host: &str) -> Option<String> {
    let host = if let Some(bracketed) = host.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) && !name.contains(':') => name,
            _ => host,
        }
    };

    normalize_domain(host)
}

fn protocol_label(fields: &RawFields<'_>, is_dns: bool) -> String {
    if is_dns {
        return "DNS".to_owned();
    }

    if first(fields.http_host).is_some() {
        return "HTTP".to_owned();
    }

    if first(fields.tls_sni).is_some() {
        return "TLS".to_owned();
    }

    if first(fields.quic_sni).is_some() {
        return "QUIC".to_owned();
    }

    match first(fields.ip_proto) {
        Some("6") => "TCP".to_owned(),
        Some("17") => "UDP".to_owned(),
        Some("1") => "ICMP".to_owned(),
        Some("58") => "ICMPv6".to_owned(),
        Some(other) => other.to_owned(),
        None if first(fields.tcp_dst_port).is_some() => "TCP".to_owned(),
        None if first(fields.udp_dst_port).is_some() => "UDP".to_owned(),
        None => "IP".to_owned(),
    }
}

/// Stores consulted while parsing, borrowed for the duration of a capture session.
pub struct LineParser<'a> {
    pub rooms: &'a ExpandedRooms,
    pub dns: &'a DnsCache,
    pub ptr: Option<&'a PtrSubmitter>,
    pub threats: &'a ThreatIntel,
    pub classifier: &'a DomainServiceClassifier,
    pub utc_offset: UtcOffset,
}

impl LineParser<'_> {
    /// Returns `None` for lines with missing fields, or without a usable timestamp or source address.
    pub fn parse(&self, line: &str) -> Option<TrafficEvent> {
        let fields = RawFields::split(line)?;

        let epoch: f64 = first(fields.epoch)?.parse().ok()?;
        let datetime = epoch_to_datetime(epoch, self.utc_offset)?;
        let src_ip: IpAddr = first(fields.src_ip)?.parse().ok()?;

        let dst_ip: Option<IpAddr> = first(fields.dst_ip).and_then(|ip| ip.parse().ok());
        let dst_port = first(fields.tcp_dst_port)
            .or_else(|| first(fields.udp_dst_port))
            .and_then(|port| port.parse::<u16>().ok());

        let room_no = self.rooms.room_or_unknown(src_ip).to_owned();

        let is_dns = fields.has_dns();
        let dns_query = first(fields.dns_query).and_then(normalize_domain);

        if is_dns {
            self.learn_answers(&fields, dns_query.as_deref());
        }

        let http_host = first(fields.http_host).map(str::to_ascii_lowercase);
        let http_uri = first(fields.http_uri).map(str::to_owned);

        let tls_sni = first(fields.tls_sni)
            .and_then(normalize_domain)
            .or_else(|| first(fields.quic_sni).and_then(normalize_domain));

        let resolved_domain = match dst_ip {
            Some(dst_ip) if tls_sni.is_none() && !is_dns => {
                let domain = self.dns.get(dst_ip);

                if domain.is_none() {
                    if let Some(ptr) = self.ptr {
                        ptr.submit(dst_ip);
                    }
                }

                domain
            }
            _ => None,
        };

        let candidate = http_host
            .as_deref()
            .and_then(host_domain)
            .or_else(|| tls_sni.clone())
            .or_else(|| dns_query.clone())
            .or_else(|| resolved_domain.clone());

        let threat_flag = self.threats.check(candidate.as_deref(), dst_ip);

        let classification = candidate
            .as_deref()
            .and_then(|domain| self.classifier.classify_or_record(domain, src_ip));

        let (asn_service, asn_category) = match classification {
            Some(classification) => (Some(classification.service), Some(classification.category)),
            None => (None, None),
        };

        Some(TrafficEvent {
            id: event_id(&room_no, datetime),
            epoch,
            time: format_display_time(datetime),
            room_no,
            src_ip,
            dst_ip,
            dst_port,
            protocol: protocol_label(&fields, is_dns),
            dns_query,
            http_host,
            http_uri,
            tls_sni,
            resolved_domain,
            threat_flag,
            asn: None,
            asn_service,
            asn_category,
        })
    }

    /// Every A/AAAA answer maps to the queried name, or to the end of the CNAME chain without a query.
    fn learn_answers(&self, fields: &RawFields<'_>, query: Option<&str>) {
        let Some(name) = query.or_else(|| last(fields.dns_cname)) else {
            return;
        };

        for answers in [fields.dns_a, fields.dns_aaaa] {
            if !answers.trim().is_empty() {
                self.dns.add_multiple(answers, name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use rstest::rstest;

    use super::*;
    use crate::classifier::DomainServiceRule;
    use crate::config::dto::ThreatConf;
    use crate::ptr::{PtrResolver, ReverseLookup};
    use crate::rooms::RoomPolicy;
    use crate::threat::ThreatCategory;

    struct NoLookup;

    #[async_trait]
    impl ReverseLookup for NoLookup {
        async fn reverse(&self, _: IpAddr) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    struct Fixture {
        rooms: ExpandedRooms,
        dns: Arc<DnsCache>,
        ptr: Arc<PtrResolver>,
        threats: ThreatIntel,
        classifier: DomainServiceClassifier,
    }

    impl Fixture {
        fn new() -> Self {
            let rooms = RoomPolicy::from_iter([("192.168.1.10".to_owned(), "101".to_owned())]).expand();
            let dns = Arc::new(DnsCache::new(100));
            let ptr = Arc::new(PtrResolver::new(Arc::clone(&dns), Arc::new(NoLookup), 10));
            let threats = ThreatIntel::new(&ThreatConf::default(), false);
            let classifier = DomainServiceClassifier::new(64, 64, None);
            classifier.apply_rules([DomainServiceRule::new("youtube.com", "YouTube", "video")]);

            Self {
                rooms,
                dns,
                ptr,
                threats,
                classifier,
            }
        }

        fn parser<'a>(&'a self, ptr: Option<&'a PtrSubmitter>) -> LineParser<'a> {
            LineParser {
                rooms: &self.rooms,
                dns: &self.dns,
                ptr,
                threats: &self.threats,
                classifier: &self.classifier,
                utc_offset: UtcOffset::UTC,
            }
        }
    }

    fn line(fields: &[(usize, &str)]) -> String {
        let mut values = vec![""; FIELDS.len()];
        for (index, value) in fields {
            values[*index] = *value;
        }
        values.join("|")
    }

    #[rstest]
    #[case::too_few_fields("1700000000.0|192.168.1.10|8.8.8.8")]
    #[case::bad_epoch("yesterday|192.168.1.10|8.8.8.8|443||6||||||||")]
    #[case::bad_source("1700000000.0|gateway|8.8.8.8|443||6||||||||")]
    #[case::empty("")]
    fn malformed_lines(#[case] line: &str) {
        let fixture = Fixture::new();
        assert!(fixture.parser(None).parse(line).is_none());
    }

    #[test]
    fn tls_connection() {
        let fixture = Fixture::new();
        let line = line(&[(0, "1700000000.5"), (1, "192.168.1.10"), (2, "142.250.196.110"), (3, "443"), (5, "6"), (12, "WWW.YouTube.com")]);

        let event = fixture.parser(None).parse(&line).unwrap();

        assert_eq!(event.room_no, "101");
        assert_eq!(event.time, "2023-11-14 22:13:20");
        assert_eq!(event.dst_port, Some(443));
        assert_eq!(event.protocol, "TLS");
        assert_eq!(event.tls_sni.as_deref(), Some("www.youtube.com"));
        assert_eq!(event.asn_service.as_deref(), Some("YouTube"));
        assert_eq!(event.asn_category.as_deref(), Some("video"));
        assert!(event.resolved_domain.is_none());
        assert!(event.id.starts_with("10120231114221320-"));
    }

    #[test]
    fn quic_server_name_is_used_without_tls() {
        let fixture = Fixture::new();
        let line = line(&[(0, "1700000000"), (1, "192.168.1.10"), (2, "142.250.196.110"), (4, "443"), (5, "17"), (13, "rr1.googlevideo.com")]);

        let event = fixture.parser(None).parse(&line).unwrap();

        assert_eq!(event.protocol, "QUIC");
        assert_eq!(event.tls_sni.as_deref(), Some("rr1.googlevideo.com"));
    }

    #[test]
    fn dns_answers_feed_the_cache() {
        let fixture = Fixture::new();
        let line = line(&[
            (0, "1700000000"),
            (1, "8.8.8.8"),
            (2, "192.168.1.10"),
            (4, "53"),
            (5, "17"),
            (6, "Example.com"),
            (7, "93.184.216.34,93.184.216.35"),
            (8, "2606:2800:220:1:248:1893:25c8:1946"),
        ]);

        let event = fixture.parser(None).parse(&line).unwrap();

        assert_eq!(event.protocol, "DNS");
        assert_eq!(event.room_no, "unknown");
        assert_eq!(event.dns_query.as_deref(), Some("example.com"));
        assert_eq!(fixture.dns.get("93.184.216.35".parse().unwrap()).as_deref(), Some("example.com"));
        assert_eq!(
            fixture.dns.get("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn cname_chain_without_query() {
        let fixture = Fixture::new();
        let line = line(&[
            (0, "1700000000"),
            (1, "8.8.8.8"),
            (2, "192.168.1.10"),
            (5, "17"),
            (7, "151.101.1.69"),
            (9, "www.example.org,example.map.fastly.net"),
        ]);

        fixture.parser(None).parse(&line).unwrap();

        assert_eq!(
            fixture.dns.get("151.101.1.69".parse().unwrap()).as_deref(),
            Some("example.map.fastly.net")
        );
    }

    #[test]
    fn known_destination_is_resolved_from_cache() {
        let fixture = Fixture::new();
        fixture.dns.add("142.250.196.110".parse().unwrap(), "youtube.com");

        let line = line(&[(0, "1700000000"), (1, "192.168.1.10"), (2, "142.250.196.110"), (3, "443"), (5, "6")]);
        let event = fixture.parser(None).parse(&line).unwrap();

        assert_eq!(event.protocol, "TCP");
        assert_eq!(event.resolved_domain.as_deref(), Some("youtube.com"));
        assert_eq!(event.asn_service.as_deref(), Some("YouTube"));
    }

    #[test]
    fn unknown_destination_goes_to_reverse_lookup() {
        let fixture = Fixture::new();
        let (submitter, _worker) = fixture.ptr.session();

        let line = line(&[(0, "1700000000"), (1, "192.168.1.10"), (2, "93.184.216.34"), (3, "443"), (5, "6")]);
        let event = fixture.parser(Some(&submitter)).parse(&line).unwrap();

        assert!(event.resolved_domain.is_none());
        assert_eq!(fixture.ptr.stats().submitted, 1);
    }

    #[tokio::test]
    async fn http_host_has_priority_for_threat_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gambling.txt"), "casino.test\n").unwrap();

        let conf = ThreatConf {
            directory: Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap(),
            ..ThreatConf::default()
        };
        let threats = ThreatIntel::new(&conf, true);
        threats.load().await.unwrap();

        let fixture = Fixture { threats, ..Fixture::new() };
        let line = line(&[
            (0, "1700000000"),
            (1, "192.168.1.10"),
            (2, "203.0.113.7"),
            (3, "80"),
            (5, "6"),
            (10, "www.casino.test:8080"),
            (11, "/spin"),
            (12, "clean.example"),
        ]);

        let event = fixture.parser(None).parse(&line).unwrap();

        assert_eq!(event.protocol, "HTTP");
        assert_eq!(event.http_host.as_deref(), Some("www.casino.test:8080"));
        assert_eq!(event.http_uri.as_deref(), Some("/spin"));
        assert_eq!(event.threat_flag, Some(ThreatCategory::Gambling));
    }

    #[rstest]
    #[case("example.com:8080", Some("example.com"))]
    #[case("Example.com", Some("example.com"))]
    #[case("[2001:db8::1]:443", Some("2001:db8::1"))]
    #[case("", None)]
    fn host_header_domain(#[case] host: &str, #[case] expected: Option<&str>) {
        assert_eq!(host_domain(host).as_deref(), expected);
    }
}
