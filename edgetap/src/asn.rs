//! Autonomous system ownership of destination addresses.
//!
//! Lookups go through the Team Cymru DNS interface:
//! `<reversed address>.origin.asn.cymru.com TXT` gives the origin AS,
//! `AS<n>.asn.cymru.com TXT` gives its registered organization.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bounded_lru::BoundedLru;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ip_utils;
use crate::persist;
use crate::resolver::DnsClient;

/// How long a failed lookup is not retried.
const FAILURE_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AsnLookup: Send + Sync {
    /// Origin AS announcing `ip`.
    async fn origin(&self, ip: IpAddr) -> anyhow::Result<Option<u32>>;

    /// Organization name registered for `asn`.
    async fn organization(&self, asn: u32) -> anyhow::Result<Option<String>>;
}

pub struct CymruAsnLookup {
    dns: DnsClient,
}

impl CymruAsnLookup {
    pub fn new(dns: DnsClient) -> Self {
        Self { dns }
    }
}

#[async_trait]
impl AsnLookup for CymruAsnLookup {
    async fn origin(&self, ip: IpAddr) -> anyhow::Result<Option<u32>> {
        let zone = match ip {
            IpAddr::V4(_) => "origin.asn.cymru.com",
            IpAddr::V6(_) => "origin6.asn.cymru.com",
        };

        let name = format!("{}.{zone}", ip_utils::reversed_labels(ip));
        let records = self.dns.txt(&name).await?;

        Ok(records.iter().find_map(|record| parse_origin(record)))
    }

    async fn organization(&self, asn: u32) -> anyhow::Result<Option<String>> {
        let records = self.dns.txt(&format!("AS{asn}.asn.cymru.com")).await?;
        Ok(records.iter().find_map(|record| parse_organization(record)))
    }
}

/// `15169 | 8.8.8.0/24 | US | arin | 2023-12-28`; multi-origin prefixes list several ASNs in the first field.
fn parse_origin(record: &str) -> Option<u32> {
    record.split('|').next()?.split_whitespace().next()?.parse().ok()
}

/// `15169 | US | arin | 2000-03-30 | GOOGLE - Google LLC, US`
fn parse_organization(record: &str) -> Option<String> {
    let org = record.split('|').nth(4)?.trim();

    if org.is_empty() { None } else { Some(org.to_owned()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnRecord {
    pub asn: Option<u32>,
    pub org: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AsnStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub lookups: u64,
    pub failures: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(IpAddr, AsnRecord)>,
}

pub struct AsnResolver {
    lookup: Box<dyn AsnLookup>,
    cache: Mutex<BoundedLru<IpAddr, AsnRecord>>,
    ttl: Duration,
    // Failed addresses and when they failed; never persisted.
    failed: Mutex<BoundedLru<IpAddr, OffsetDateTime>>,
    failure_ttl: Duration,
    persist_every: usize,
    path: Option<Utf8PathBuf>,
    unsaved: AtomicUsize,
    hits: AtomicU64,
    lookups: AtomicU64,
    failures: AtomicU64,
}

impl AsnResolver {
    pub fn new(
        lookup: Box<dyn AsnLookup>,
        max_entries: usize,
        ttl: Duration,
        persist_every: usize,
        path: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            lookup,
            cache: Mutex::new(BoundedLru::new(max_entries)),
            ttl,
            failed: Mutex::new(BoundedLru::new(max_entries)),
            failure_ttl: FAILURE_TTL,
            persist_every: persist_every.max(1),
            path,
            unsaved: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// `(asn, org)` of `ip`; non routable addresses are never looked up.
    pub async fn lookup(&self, ip: IpAddr) -> (Option<u32>, Option<String>) {
        if !ip_utils::is_public(ip) {
            return (None, None);
        }

        let now = OffsetDateTime::now_utc();

        if let Some(record) = self.cached(ip, now) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (record.asn, record.org);
        }

        if self.recently_failed(ip, now) {
            return (None, None);
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);

        let record = match self.fetch(ip).await {
            Ok((asn, org)) => AsnRecord {
                asn,
                org,
                fetched_at: now,
            },
            Err(error) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.failed.lock().put(ip, now);
                debug!(%ip, error = format!("{error:#}"), "ASN lookup failed");
                return (None, None);
            }
        };

        self.failed.lock().remove(&ip);

        self.cache.lock().put(ip, record.clone());
        self.unsaved.fetch_add(1, Ordering::Relaxed);

        (record.asn, record.org)
    }

    fn cached(&self, ip: IpAddr, now: OffsetDateTime) -> Option<AsnRecord> {
        let mut cache = self.cache.lock();
        let record = cache.get(&ip)?;

        if now - record.fetched_at > self.ttl {
            None
        } else {
            Some(record.clone())
        }
    }

    fn recently_failed(&self, ip: IpAddr, now: OffsetDateTime) -> bool {
        let mut failed = self.failed.lock();

        let Some(failed_at) = failed.peek(&ip).copied() else {
            return false;
        };

        if now - failed_at <= self.failure_ttl {
            true
        } else {
            failed.remove(&ip);
            false
        }
    }

    async fn fetch(&self, ip: IpAddr) -> anyhow::Result<(Option<u32>, Option<String>)> {
        let Some(asn) = self.lookup.origin(ip).await? else {
            return Ok((None, None));
        };

        // A missing organization doesn't invalidate the origin.
        let org = match self.lookup.organization(asn).await {
            Ok(org) => org,
            Err(error) => {
                debug!(asn, error = format!("{error:#}"), "AS organization lookup failed");
                None
            }
        };

        Ok((Some(asn), org))
    }

    /// Whether enough new entries were added since the last save.
    pub fn needs_persist(&self) -> bool {
        self.path.is_some() && self.unsaved.load(Ordering::Relaxed) >= self.persist_every
    }

    pub fn stats(&self) -> AsnStats {
        let cache = self.cache.lock();

        AsnStats {
            entries: cache.len(),
            capacity: cache.capacity(),
            hits: self.hits.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let unsaved = self.unsaved.swap(0, Ordering::Relaxed);

        let snapshot = Snapshot {
            entries: self
                .cache
                .lock()
                .iter()
                .map(|(ip, record)| (*ip, record.clone()))
                .collect(),
        };

        if let Err(error) = persist::save_json(path, &snapshot).await {
            self.unsaved.fetch_add(unsaved, Ordering::Relaxed);
            return Err(error);
        }

        debug!(%path, entries = snapshot.entries.len(), "ASN cache saved");

        Ok(())
    }

    /// Restores a snapshot, skipping entries already expired.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let Some(snapshot) = persist::load_json::<Snapshot>(path).await? else {
            return Ok(0);
        };

        let now = OffsetDateTime::now_utc();
        let mut cache = self.cache.lock();
        let mut restored = 0;

        for (ip, record) in snapshot.entries {
            if now - record.fetched_at <= self.ttl {
                cache.put(ip, record);
                restored += 1;
            }
        }

        Ok(restored)
    }
}

/// Well-known networks and the service running them.
const WELL_KNOWN_ASNS: &[(u32, &str, &str)] = &[
    (15169, "Google", "search"),
    (36040, "YouTube", "video"),
    (396982, "Google Cloud", "cloud"),
    (16509, "Amazon AWS", "cloud"),
    (14618, "Amazon AWS", "cloud"),
    (8075, "Microsoft", "cloud"),
    (8068, "Microsoft", "cloud"),
    (32934, "Meta", "social"),
    (13414, "Twitter", "social"),
    (396986, "ByteDance", "social"),
    (2906, "Netflix", "video"),
    (46489, "Twitch", "video"),
    (714, "Apple", "platform"),
    (6185, "Apple", "platform"),
    (13335, "Cloudflare", "cdn"),
    (20940, "Akamai", "cdn"),
    (16625, "Akamai", "cdn"),
    (54113, "Fastly", "cdn"),
    (19679, "Dropbox", "storage"),
    (62041, "Telegram", "messaging"),
    (32590, "Valve", "gaming"),
    (57976, "Blizzard", "gaming"),
    (6507, "Riot Games", "gaming"),
    (14061, "DigitalOcean", "cloud"),
    (24940, "Hetzner", "cloud"),
    (16276, "OVH", "cloud"),
    (31898, "Oracle Cloud", "cloud"),
    (45102, "Alibaba Cloud", "cloud"),
    (132203, "Tencent Cloud", "cloud"),
    (38365, "Baidu", "search"),
    (23576, "Naver", "portal"),
    (4766, "KT", "isp"),
    (9318, "SK Broadband", "isp"),
    (3786, "LG U+", "isp"),
];

/// `(service, category)` of an AS: the curated name when known, else the organization with category `unknown`.
pub fn classify_asn(asn: Option<u32>, org: Option<&str>) -> (Option<String>, Option<String>) {
    let known = asn.and_then(|asn| WELL_KNOWN_ASNS.iter().find(|(known, ..)| *known == asn));

    match (known, org) {
        (Some((_, service, category)), _) => (Some((*service).to_owned()), Some((*category).to_owned())),
        (None, Some(org)) => (Some(org.to_owned()), Some("unknown".to_owned())),
        (None, None) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct CountingLookup {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl AsnLookup for Arc<CountingLookup> {
        async fn origin(&self, ip: IpAddr) -> anyhow::Result<Option<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("timeout");
            }

            Ok(match ip.to_string().as_str() {
                "8.8.8.8" => Some(15169),
                "203.0.113.200" => None,
                _ => Some(64500),
            })
        }

        async fn organization(&self, asn: u32) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("ORG-{asn}")))
        }
    }

    fn resolver(lookup: Arc<CountingLookup>, path: Option<Utf8PathBuf>) -> AsnResolver {
        AsnResolver::new(Box::new(lookup), 16, Duration::from_secs(3600), 2, path)
    }

    #[rstest]
    #[case("15169 | 8.8.8.0/24 | US | arin | 2023-12-28", Some(15169))]
    #[case("13335 209242 | 104.16.0.0/13 | US | arin | 2014-03-28", Some(13335))]
    #[case("", None)]
    fn origin_records(#[case] record: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_origin(record), expected);
    }

    #[test]
    fn organization_record() {
        assert_eq!(
            parse_organization("15169 | US | arin | 2000-03-30 | GOOGLE - Google LLC, US").as_deref(),
            Some("GOOGLE - Google LLC, US")
        );
        assert_eq!(parse_organization("15169 | US"), None);
    }

    #[tokio::test]
    async fn private_addresses_are_not_looked_up() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = resolver(Arc::clone(&lookup), None);

        assert_eq!(resolver.lookup("192.168.0.1".parse().unwrap()).await, (None, None));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn results_are_cached() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = resolver(Arc::clone(&lookup), None);
        let ip = "8.8.8.8".parse().unwrap();

        let first = resolver.lookup(ip).await;
        let second = resolver.lookup(ip).await;

        assert_eq!(first, (Some(15169), Some("ORG-15169".to_owned())));
        assert_eq!(first, second);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().hits, 1);
    }

    #[tokio::test]
    async fn no_asn_is_cached() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = resolver(Arc::clone(&lookup), None);
        let unannounced = "203.0.113.200".parse().unwrap();

        resolver.lookup(unannounced).await;
        resolver.lookup(unannounced).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_retried_until_they_expire() {
        let failing = Arc::new(CountingLookup {
            fail: true,
            ..Default::default()
        });
        let resolver = resolver(Arc::clone(&failing), None);
        let ip = "8.8.8.8".parse().unwrap();

        assert_eq!(resolver.lookup(ip).await, (None, None));
        assert_eq!(resolver.lookup(ip).await, (None, None));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().failures, 1);
        assert_eq!(resolver.stats().entries, 0);

        resolver
            .failed
            .lock()
            .put(ip, OffsetDateTime::now_utc() - FAILURE_TTL - Duration::from_secs(1));

        resolver.lookup(ip).await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.stats().failures, 2);
    }

    #[tokio::test]
    async fn stale_entries_are_refreshed() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = AsnResolver::new(Box::new(Arc::clone(&lookup)), 16, Duration::ZERO, 50, None);
        let ip = "8.8.8.8".parse().unwrap();

        resolver.cache.lock().put(
            ip,
            AsnRecord {
                asn: Some(1),
                org: None,
                fetched_at: OffsetDateTime::now_utc() - Duration::from_secs(10),
            },
        );

        assert_eq!(resolver.lookup(ip).await.0, Some(15169));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persisted_after_enough_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("asn.json")).unwrap();
        let resolver = resolver(Arc::new(CountingLookup::default()), Some(path.clone()));

        resolver.lookup("8.8.8.8".parse().unwrap()).await;
        assert!(!resolver.needs_persist());

        resolver.lookup("9.9.9.9".parse().unwrap()).await;
        assert!(resolver.needs_persist());

        resolver.save().await.unwrap();
        assert!(!resolver.needs_persist());

        let restored = self::resolver(Arc::new(CountingLookup::default()), Some(path));
        assert_eq!(restored.load().await.unwrap(), 2);
    }

    #[rstest]
    #[case(Some(15169), Some("GOOGLE"), Some("Google"), Some("search"))]
    #[case(Some(64500), Some("EXAMPLE-NET"), Some("EXAMPLE-NET"), Some("unknown"))]
    #[case(None, None, None, None)]
    fn asn_classification(
        #[case] asn: Option<u32>,
        #[case] org: Option<&str>,
        #[case] service: Option<&str>,
        #[case] category: Option<&str>,
    ) {
        let (actual_service, actual_category) = classify_asn(asn, org);
        assert_eq!(actual_service.as_deref(), service);
        assert_eq!(actual_category.as_deref(), category);
    }
}
