//! Threat intelligence lists: four domain categories and one IP category.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use edgetap_task::{ShutdownSignal, Task};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::dto::{ThreatConf, ThreatSources};
use crate::dns_cache::normalize_domain;
use crate::persist;

const META_FILE: &str = "meta.json";

/// Placeholder names found in hosts files.
const IGNORED_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
    "0.0.0.0",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Malware,
    Adult,
    Gambling,
    Fakenews,
    Tor,
}

impl ThreatCategory {
    /// Domain lists, checked in this order.
    pub const DOMAIN_LISTS: [ThreatCategory; 4] = [Self::Malware, Self::Adult, Self::Gambling, Self::Fakenews];

    pub const ALL: [ThreatCategory; 5] = [Self::Malware, Self::Adult, Self::Gambling, Self::Fakenews, Self::Tor];

    pub fn as_str(self) -> &'static str {
        match self {
            ThreatCategory::Malware => "malware",
            ThreatCategory::Adult => "adult",
            ThreatCategory::Gambling => "gambling",
            ThreatCategory::Fakenews => "fakenews",
            ThreatCategory::Tor => "tor",
        }
    }

    fn source(self, sources: &ThreatSources) -> Option<&Url> {
        match self {
            ThreatCategory::Malware => sources.malware.as_ref(),
            ThreatCategory::Adult => sources.adult.as_ref(),
            ThreatCategory::Gambling => sources.gambling.as_ref(),
            ThreatCategory::Fakenews => sources.fakenews.as_ref(),
            ThreatCategory::Tor => sources.tor.as_ref(),
        }
    }

    fn file_name(self) -> String {
        format!("{}.txt", self.as_str())
    }
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        self.client
            .get(url.clone())
            .send()
            .await
            .context("failed to send request")?
            .error_for_status()
            .context("feed server responded with an error")?
            .text()
            .await
            .context("failed to read feed body")
    }
}

#[derive(Default)]
struct Lists {
    domains: BTreeMap<ThreatCategory, HashSet<String>>,
    tor: HashSet<IpAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Meta {
    #[serde(with = "time::serde::timestamp::option", default)]
    last_update: Option<OffsetDateTime>,
    /// Last successful refresh of each list
    #[serde(default)]
    versions: BTreeMap<ThreatCategory, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Within the minimum refresh interval
    Skipped,
    Updated {
        refreshed: Vec<ThreatCategory>,
        failed: Vec<ThreatCategory>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatStats {
    pub sizes: BTreeMap<ThreatCategory, usize>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

pub struct ThreatIntel {
    sources: ThreatSources,
    directory: Option<Utf8PathBuf>,
    min_refresh: Duration,
    lists: RwLock<Lists>,
    meta: RwLock<Meta>,
    update_lock: Semaphore,
}

impl ThreatIntel {
    pub fn new(conf: &ThreatConf, persist: bool) -> Self {
        Self {
            sources: conf.sources.clone(),
            directory: persist.then(|| conf.directory.clone()),
            min_refresh: Duration::from_secs(conf.min_refresh_secs),
            lists: RwLock::new(Lists::default()),
            meta: RwLock::new(Meta::default()),
            update_lock: Semaphore::new(1),
        }
    }

    /// Reads the lists saved by a previous run.
    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };

        if let Some(meta) = persist::load_json::<Meta>(&directory.join(META_FILE)).await? {
            *self.meta.write() = meta;
        }

        for category in ThreatCategory::ALL {
            let path = directory.join(category.file_name());

            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    self.replace(category, &text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(%path, error = %e, "Failed to read threat list"),
            }
        }

        Ok(())
    }

    /// Refreshes every list from its source.
    ///
    /// Does nothing if the previous refresh is more recent than the minimum interval, unless `force` is set.
    pub async fn update(&self, fetcher: &dyn FeedFetcher, force: bool) -> UpdateOutcome {
        let _permit = self.update_lock.acquire().await;

        let now = OffsetDateTime::now_utc();

        if !force {
            if let Some(last_update) = self.meta.read().last_update {
                if now - last_update < self.min_refresh {
                    return UpdateOutcome::Skipped;
                }
            }
        }

        let mut refreshed = Vec::new();
        let mut failed = Vec::new();

        for category in ThreatCategory::ALL {
            let Some(url) = category.source(&self.sources) else {
                continue;
            };

            match fetcher.fetch(url).await {
                Ok(text) => {
                    let count = self.replace(category, &text);
                    info!(list = category.as_str(), count, "Threat list refreshed");

                    self.meta.write().versions.insert(category, now.unix_timestamp());
                    self.persist_list(category).await;

                    refreshed.push(category);
                }
                Err(error) => {
                    warn!(list = category.as_str(), %url, error = format!("{error:#}"), "Threat list fetch failed");
                    failed.push(category);
                }
            }
        }

        self.meta.write().last_update = Some(now);
        self.persist_meta().await;

        UpdateOutcome::Updated { refreshed, failed }
    }

    /// Threat category of a domain or an address.
    ///
    /// The domain and each of its parents are checked against every domain list in priority order,
    /// then the address against the exit node list.
    pub fn check(&self, domain: Option<&str>, ip: Option<IpAddr>) -> Option<ThreatCategory> {
        let lists = self.lists.read();

        if let Some(domain) = domain.and_then(normalize_domain) {
            for category in ThreatCategory::DOMAIN_LISTS {
                let Some(set) = lists.domains.get(&category) else {
                    continue;
                };

                if parent_domains(&domain).any(|candidate| set.contains(candidate)) {
                    return Some(category);
                }
            }
        }

        match ip {
            Some(ip) if lists.tor.contains(&ip) => Some(ThreatCategory::Tor),
            _ => None,
        }
    }

    pub fn stats(&self) -> ThreatStats {
        let lists = self.lists.read();

        let mut sizes: BTreeMap<_, _> = ThreatCategory::DOMAIN_LISTS
            .iter()
            .map(|category| (*category, lists.domains.get(category).map_or(0, HashSet::len)))
            .collect();
        sizes.insert(ThreatCategory::Tor, lists.tor.len());

        ThreatStats {
            sizes,
            last_update: self.meta.read().last_update,
        }
    }

    fn replace(&self, category: ThreatCategory, text: &str) -> usize {
        if category == ThreatCategory::Tor {
            let ips = parse_ip_list(text);
            let count = ips.len();
            self.lists.write().tor = ips;
            count
        } else {
            let domains = parse_hosts(text);
            let count = domains.len();
            self.lists.write().domains.insert(category, domains);
            count
        }
    }

    async fn persist_list(&self, category: ThreatCategory) {
        let Some(directory) = &self.directory else {
            return;
        };

        let text = {
            let lists = self.lists.read();

            let mut lines: Vec<String> = if category == ThreatCategory::Tor {
                lists.tor.iter().map(IpAddr::to_string).collect()
            } else {
                lists.domains.get(&category).into_iter().flatten().cloned().collect()
            };

            lines.sort_unstable();
            lines.join("\n")
        };

        if let Err(error) = write_list(directory, &category.file_name(), text).await {
            warn!(list = category.as_str(), error = format!("{error:#}"), "Failed to persist threat list");
        }
    }

    async fn persist_meta(&self) {
        let Some(directory) = &self.directory else {
            return;
        };

        let meta = self.meta.read().clone();

        if let Err(error) = persist::save_json(&directory.join(META_FILE), &meta).await {
            warn!(error = format!("{error:#}"), "Failed to persist threat metadata");
        }
    }
}

async fn write_list(directory: &Utf8Path, file_name: &str, text: String) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(directory)
        .await
        .with_context(|| format!("failed to create {directory}"))?;

    let path = directory.join(file_name);

    tokio::fs::write(&path, text)
        .await
        .with_context(|| format!("failed to write {path}"))
}

/// `domain`, then every parent down to the top-level label.
fn parent_domains(domain: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(domain), |current| current.split_once('.').map(|(_, parent)| parent))
}

/// Hosts file (`0.0.0.0 domain ...`) or plain domain-per-line list.
pub fn parse_hosts(text: &str) -> HashSet<String> {
    let mut domains = HashSet::new();

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut tokens = line.split_whitespace().peekable();

        let Some(first) = tokens.peek() else {
            continue;
        };

        if first.parse::<IpAddr>().is_ok() {
            tokens.next();
        }

        for token in tokens {
            if IGNORED_HOSTS.contains(&token) || token.parse::<IpAddr>().is_ok() {
                continue;
            }

            if let Some(domain) = normalize_domain(token) {
                domains.insert(domain);
            }
        }
    }

    domains
}

/// One address per line; anything else is ignored.
pub fn parse_ip_list(text: &str) -> HashSet<IpAddr> {
    text.lines()
        .filter_map(|line| line.split('#').next())
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Periodically refreshes the threat lists.
pub struct ThreatRefreshTask {
    pub threats: Arc<ThreatIntel>,
    pub fetcher: Arc<dyn FeedFetcher>,
    pub check_interval: Duration,
}

#[async_trait]
impl Task for ThreatRefreshTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "threat refresh";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        debug!("Task started");

        loop {
            tokio::select! {
                outcome = self.threats.update(self.fetcher.as_ref(), false) => {
                    if let UpdateOutcome::Updated { refreshed, failed } = outcome {
                        debug!(?refreshed, ?failed, "Threat lists update complete");
                    }
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FakeFetcher {
        bodies: HashMap<String, anyhow::Result<String>>,
    }

    impl FakeFetcher {
        fn new(bodies: &[(&str, Option<&str>)]) -> Self {
            let bodies = bodies
                .iter()
                .map(|(url, body)| {
                    let body = match body {
                        Some(body) => Ok((*body).to_owned()),
                        None => Err(anyhow::anyhow!("503")),
                    };
                    ((*url).to_owned(), body)
                })
                .collect();

            Self { bodies }
        }
    }

    #[async_trait]
    impl FeedFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
            match self.bodies.get(url.as_str()) {
                Some(Ok(body)) => Ok(body.clone()),
                _ => anyhow::bail!("unavailable"),
            }
        }
    }

    fn conf(directory: &Utf8Path) -> ThreatConf {
        let url = |name: &str| Url::parse(&format!("https://feeds.test/{name}")).ok();

        ThreatConf {
            directory: directory.to_owned(),
            sources: ThreatSources {
                malware: url("malware"),
                adult: url("adult"),
                gambling: url("gambling"),
                fakenews: None,
                tor: url("tor"),
            },
            ..ThreatConf::default()
        }
    }

    fn intel_with(category: ThreatCategory, text: &str) -> ThreatIntel {
        let intel = ThreatIntel::new(&ThreatConf::default(), false);
        intel.replace(category, text);
        intel
    }

    #[test]
    fn hosts_format() {
        let text = "# header\n127.0.0.1 localhost\n0.0.0.0 Bad.Example.com # trailing\n0.0.0.0 a.test b.test\nplain.test\n\n";
        let domains = parse_hosts(text);

        let mut domains: Vec<_> = domains.into_iter().collect();
        domains.sort();
        assert_eq!(domains, ["a.test", "b.test", "bad.example.com", "plain.test"]);
    }

    #[test]
    fn subdomain_of_listed_domain_is_flagged() {
        let intel = intel_with(ThreatCategory::Malware, "0.0.0.0 evil.test");

        assert_eq!(intel.check(Some("cdn.eu.evil.test"), None), Some(ThreatCategory::Malware));
        assert_eq!(intel.check(Some("EVIL.test."), None), Some(ThreatCategory::Malware));
        assert_eq!(intel.check(Some("notevil.test"), None), None);
    }

    #[test]
    fn domain_lists_have_priority_over_each_other() {
        let intel = intel_with(ThreatCategory::Gambling, "casino.test");
        intel.replace(ThreatCategory::Malware, "casino.test");

        assert_eq!(intel.check(Some("www.casino.test"), None), Some(ThreatCategory::Malware));
    }

    #[test]
    fn exit_node_address() {
        let intel = intel_with(ThreatCategory::Tor, "185.220.101.1\n# comment\nnot-an-ip\n");

        assert_eq!(
            intel.check(Some("example.com"), Some("185.220.101.1".parse().unwrap())),
            Some(ThreatCategory::Tor)
        );
        assert_eq!(intel.check(None, Some("185.220.101.2".parse().unwrap())), None);
    }

    #[tokio::test]
    async fn failed_source_keeps_previous_list() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let intel = ThreatIntel::new(&conf(&dir), true);

        let fetcher = FakeFetcher::new(&[
            ("https://feeds.test/malware", Some("0.0.0.0 old.test")),
            ("https://feeds.test/adult", Some("0.0.0.0 adult.test")),
            ("https://feeds.test/tor", Some("185.220.101.1")),
        ]);
        intel.update(&fetcher, true).await;

        let fetcher = FakeFetcher::new(&[
            ("https://feeds.test/malware", None),
            ("https://feeds.test/adult", Some("0.0.0.0 new-adult.test")),
        ]);
        let outcome = intel.update(&fetcher, true).await;

        let UpdateOutcome::Updated { refreshed, failed } = outcome else {
            panic!("forced update was skipped");
        };
        assert_eq!(refreshed, [ThreatCategory::Adult]);
        assert_eq!(failed, [ThreatCategory::Malware, ThreatCategory::Gambling, ThreatCategory::Tor]);

        assert_eq!(intel.check(Some("old.test"), None), Some(ThreatCategory::Malware));
        assert_eq!(intel.check(Some("adult.test"), None), None);
        assert_eq!(intel.check(Some("new-adult.test"), None), Some(ThreatCategory::Adult));
    }

    #[tokio::test]
    async fn refresh_is_rate_limited_unless_forced() {
        let intel = ThreatIntel::new(&conf(Utf8Path::new("/nonexistent")), false);
        let fetcher = FakeFetcher::new(&[("https://feeds.test/malware", Some("0.0.0.0 a.test"))]);

        assert!(matches!(intel.update(&fetcher, false).await, UpdateOutcome::Updated { .. }));
        assert_eq!(intel.update(&fetcher, false).await, UpdateOutcome::Skipped);
        assert!(matches!(intel.update(&fetcher, true).await, UpdateOutcome::Updated { .. }));
    }

    #[tokio::test]
    async fn lists_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let intel = ThreatIntel::new(&conf(&dir), true);
        let fetcher = FakeFetcher::new(&[
            ("https://feeds.test/gambling", Some("0.0.0.0 bet.test")),
            ("https://feeds.test/tor", Some("185.220.101.1")),
        ]);
        intel.update(&fetcher, false).await;

        let restored = ThreatIntel::new(&conf(&dir), true);
        restored.load().await.unwrap();

        assert_eq!(restored.check(Some("www.bet.test"), None), Some(ThreatCategory::Gambling));
        assert_eq!(restored.stats().sizes[&ThreatCategory::Tor], 1);
        assert!(restored.stats().last_update.is_some());
    }
}
