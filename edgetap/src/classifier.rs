//! Domain → known service dictionary.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use bounded_lru::BoundedLru;
use camino::Utf8PathBuf;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::dns_cache::normalize_domain;
use crate::persist;

const DEFAULT_ROLE: &str = "primary";

const MAX_SAMPLE_IPS: usize = 5;

/// Rule as stored in the rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainServiceRule {
    pub pattern: String,
    pub service: String,
    pub category: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    DEFAULT_ROLE.to_owned()
}

impl DomainServiceRule {
    pub fn new(pattern: impl Into<String>, service: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            service: service.into(),
            category: category.into(),
            role: default_role(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePattern {
    /// Dotted pattern matching the domain itself, its subdomains, or a dotted label run inside it
    Suffix(String),
    /// Separator-free pattern matching any domain containing it
    Substring(String),
}

impl RulePattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = normalize_domain(pattern)?;

        if pattern.contains('.') {
            Some(Self::Suffix(pattern))
        } else {
            Some(Self::Substring(pattern))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RulePattern::Suffix(pattern) | RulePattern::Substring(pattern) => pattern,
        }
    }

    /// `domain` must already be lowercased.
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            RulePattern::Suffix(pattern) => {
                domain == pattern
                    || domain.strip_suffix(pattern.as_str()).is_some_and(|head| head.ends_with('.'))
                    || domain.strip_prefix(pattern.as_str()).is_some_and(|tail| tail.starts_with('.'))
                    || domain.contains(&format!(".{pattern}."))
            }
            RulePattern::Substring(pattern) => domain.contains(pattern.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub service: String,
    pub category: String,
    pub role: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("empty rule pattern")]
    EmptyPattern,
    #[error("a rule for `{0}` already exists")]
    DuplicatePattern(String),
    #[error("no rule for `{0}`")]
    NotFound(String),
    /// The change is applied in memory but the rules file is stale.
    #[error("failed to write the rules file: {0:#}")]
    Persist(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct UnknownDomainRecord {
    pub domain: String,
    pub hits: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub sample_ips: Vec<IpAddr>,
}

/// FIFO-bounded record of unclassified domains.
struct UnknownDomains {
    records: HashMap<String, UnknownDomainRecord>,
    order: VecDeque<String>,
    max: usize,
}

impl UnknownDomains {
    fn new(max: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            max: max.max(1),
        }
    }

    fn record(&mut self, domain: &str, src_ip: IpAddr, now: OffsetDateTime) {
        if let Some(record) = self.records.get_mut(domain) {
            record.hits += 1;
            record.last_seen = now;

            if record.sample_ips.len() < MAX_SAMPLE_IPS && !record.sample_ips.contains(&src_ip) {
                record.sample_ips.push(src_ip);
            }

            return;
        }

        while self.records.len() >= self.max {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
        }

        self.order.push_back(domain.to_owned());
        self.records.insert(
            domain.to_owned(),
            UnknownDomainRecord {
                domain: domain.to_owned(),
                hits: 1,
                first_seen: now,
                last_seen: now,
                sample_ips: vec![src_ip],
            },
        );
    }

    fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.records.retain(|domain, _| keep(domain.as_str()));
        let records = &self.records;
        self.order.retain(|domain| records.contains_key(domain));
    }
}

struct CompiledRule {
    pattern: RulePattern,
    rule: DomainServiceRule,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClassifierStats {
    pub rules: usize,
    pub cached: usize,
    pub unknown_domains: usize,
}

pub struct DomainServiceClassifier {
    rules: RwLock<Vec<CompiledRule>>,
    cache: Mutex<BoundedLru<String, Option<Classification>>>,
    unknown: Mutex<UnknownDomains>,
    path: Option<Utf8PathBuf>,
}

impl DomainServiceClassifier {
    pub fn new(cache_size: usize, unknown_max: usize, path: Option<Utf8PathBuf>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            cache: Mutex::new(BoundedLru::new(cache_size)),
            unknown: Mutex::new(UnknownDomains::new(unknown_max)),
            path,
        }
    }

    /// Resolves the service behind `domain`.
    ///
    /// Dotted rules are tried first and the longest matching pattern wins;
    /// substring rules are only consulted when no dotted rule matched.
    pub fn classify(&self, domain: &str) -> Option<Classification> {
        let domain = normalize_domain(domain)?;

        if let Some(cached) = self.cache.lock().get(&domain) {
            return cached.clone();
        }

        let rules = self.rules.read();

        let suffix_match = rules
            .iter()
            .filter(|compiled| matches!(compiled.pattern, RulePattern::Suffix(_)))
            .filter(|compiled| compiled.pattern.matches(&domain))
            .max_by_key(|compiled| compiled.pattern.as_str().len());

        let best = suffix_match.or_else(|| {
            rules
                .iter()
                .filter(|compiled| matches!(compiled.pattern, RulePattern::Substring(_)))
                .find(|compiled| compiled.pattern.matches(&domain))
        });

        let classification = best.map(|compiled| Classification {
            service: compiled.rule.service.clone(),
            category: compiled.rule.category.clone(),
            role: compiled.rule.role.clone(),
        });

        // Cached while the rules are still locked so that a concurrent change can't be missed.
        self.cache.lock().put(domain, classification.clone());

        classification
    }

    /// Classifies `domain`, recording it as unknown when nothing matches.
    pub fn classify_or_record(&self, domain: &str, src_ip: IpAddr) -> Option<Classification> {
        let classification = self.classify(domain);

        if classification.is_none() {
            if let Some(domain) = normalize_domain(domain) {
                if domain.parse::<IpAddr>().is_err() && !domain.ends_with(".arpa") {
                    self.unknown.lock().record(&domain, src_ip, OffsetDateTime::now_utc());
                }
            }
        }

        classification
    }

    /// Every rule change below is written to the rules file before returning.
    pub async fn add_rule(&self, rule: DomainServiceRule) -> Result<(), ClassifierError> {
        let compiled = compile(rule)?;

        {
            let mut rules = self.rules.write();

            if rules.iter().any(|existing| existing.pattern == compiled.pattern) {
                return Err(ClassifierError::DuplicatePattern(compiled.rule.pattern));
            }

            rules.push(compiled);
        }

        self.on_rules_changed(true);
        self.persist_rules().await?;

        Ok(())
    }

    /// Replaces the rule having the same pattern.
    pub async fn update_rule(&self, rule: DomainServiceRule) -> Result<(), ClassifierError> {
        let compiled = compile(rule)?;

        {
            let mut rules = self.rules.write();

            let Some(existing) = rules.iter_mut().find(|existing| existing.pattern == compiled.pattern) else {
                return Err(ClassifierError::NotFound(compiled.rule.pattern));
            };

            *existing = compiled;
        }

        self.on_rules_changed(true);
        self.persist_rules().await?;

        Ok(())
    }

    pub async fn delete_rule(&self, pattern: &str) -> Result<DomainServiceRule, ClassifierError> {
        let pattern = RulePattern::parse(pattern).ok_or(ClassifierError::EmptyPattern)?;

        let removed = {
            let mut rules = self.rules.write();

            let Some(position) = rules.iter().position(|existing| existing.pattern == pattern) else {
                return Err(ClassifierError::NotFound(pattern.as_str().to_owned()));
            };

            rules.remove(position)
        };

        self.on_rules_changed(false);
        self.persist_rules().await?;

        Ok(removed.rule)
    }

    /// Adds or replaces every rule, returns how many were applied.
    pub async fn import_rules(
        &self,
        rules: impl IntoIterator<Item = DomainServiceRule>,
    ) -> Result<usize, ClassifierError> {
        let applied = self.apply_rules(rules);
        self.persist_rules().await?;
        Ok(applied)
    }

    /// In-memory counterpart of [`DomainServiceClassifier::import_rules`].
    pub(crate) fn apply_rules(&self, rules: impl IntoIterator<Item = DomainServiceRule>) -> usize {
        let mut applied = 0;

        {
            let mut current = self.rules.write();

            for rule in rules {
                let compiled = match compile(rule) {
                    Ok(compiled) => compiled,
                    Err(error) => {
                        warn!(%error, "Skipped service rule");
                        continue;
                    }
                };

                match current.iter_mut().find(|existing| existing.pattern == compiled.pattern) {
                    Some(existing) => *existing = compiled,
                    None => current.push(compiled),
                }

                applied += 1;
            }
        }

        self.on_rules_changed(true);

        applied
    }

    pub fn rules(&self) -> Vec<DomainServiceRule> {
        self.rules.read().iter().map(|compiled| compiled.rule.clone()).collect()
    }

    /// Unknown domains, most hit first.
    pub fn unknown_domains(&self) -> Vec<UnknownDomainRecord> {
        let mut records: Vec<_> = self.unknown.lock().records.values().cloned().collect();
        records.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.domain.cmp(&b.domain)));
        records
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            rules: self.rules.read().len(),
            cached: self.cache.lock().len(),
            unknown_domains: self.unknown.lock().records.len(),
        }
    }

    fn on_rules_changed(&self, rules_added: bool) {
        self.cache.lock().clear();

        if rules_added {
            let rules = self.rules.read();
            self.unknown
                .lock()
                .retain(|domain| !rules.iter().any(|compiled| compiled.pattern.matches(domain)));
        }
    }

    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let Some(rules) = persist::load_json::<Vec<DomainServiceRule>>(path).await? else {
            return Ok(0);
        };

        Ok(self.apply_rules(rules))
    }

    async fn persist_rules(&self) -> Result<(), ClassifierError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        persist::save_json(path, &self.rules()).await.map_err(ClassifierError::Persist)?;
        debug!(%path, "Service rules written");

        Ok(())
    }
}

fn compile(rule: DomainServiceRule) -> Result<CompiledRule, ClassifierError> {
    let pattern = RulePattern::parse(&rule.pattern).ok_or(ClassifierError::EmptyPattern)?;

    let rule = DomainServiceRule {
        pattern: pattern.as_str().to_owned(),
        role: if rule.role.trim().is_empty() { default_role() } else { rule.role },
        ..rule
    };

    Ok(CompiledRule { pattern, rule })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn classifier(rules: &[(&str, &str)]) -> DomainServiceClassifier {
        let classifier = DomainServiceClassifier::new(64, 8, None);
        classifier.apply_rules(rules.iter().map(|(pattern, service)| DomainServiceRule::new(*pattern, *service, "web")));
        classifier
    }

    fn service(classifier: &DomainServiceClassifier, domain: &str) -> Option<String> {
        classifier.classify(domain).map(|classification| classification.service)
    }

    #[rstest]
    #[case("example.com", true)]
    #[case("www.example.com", true)]
    #[case("api.example.com.cdn.net", true)]
    #[case("example.com.evil.net", true)]
    #[case("notexample.com", false)]
    #[case("example.community", false)]
    fn suffix_pattern(#[case] domain: &str, #[case] expected: bool) {
        let pattern = RulePattern::parse("example.com").unwrap();
        assert!(matches!(pattern, RulePattern::Suffix(_)));
        assert_eq!(pattern.matches(domain), expected);
    }

    #[rstest]
    #[case("example.org", true)]
    #[case("myexamples.net", true)]
    #[case("sample.org", false)]
    fn substring_pattern(#[case] domain: &str, #[case] expected: bool) {
        let pattern = RulePattern::parse("example").unwrap();
        assert!(matches!(pattern, RulePattern::Substring(_)));
        assert_eq!(pattern.matches(domain), expected);
    }

    #[test]
    fn longest_suffix_wins() {
        let classifier = classifier(&[("google.com", "Google"), ("mail.google.com", "Gmail")]);

        assert_eq!(service(&classifier, "inbox.mail.google.com").as_deref(), Some("Gmail"));
        assert_eq!(service(&classifier, "www.google.com").as_deref(), Some("Google"));
    }

    #[test]
    fn substring_only_when_no_suffix_matches() {
        let classifier = classifier(&[("netflix", "Netflix"), ("nflxvideo.net", "Netflix CDN")]);

        assert_eq!(service(&classifier, "ipv4-c001.nflxvideo.net").as_deref(), Some("Netflix CDN"));
        assert_eq!(service(&classifier, "assets.netflix.io").as_deref(), Some("Netflix"));
    }

    #[test]
    fn lookups_are_case_insensitive_and_role_defaults() {
        let classifier = classifier(&[("YouTube.com", "YouTube")]);

        let classification = classifier.classify("WWW.YOUTUBE.COM.").unwrap();
        assert_eq!(classification.service, "YouTube");
        assert_eq!(classification.role, "primary");
    }

    #[tokio::test]
    async fn cache_is_invalidated_on_change() {
        let classifier = classifier(&[]);

        assert_eq!(service(&classifier, "www.twitch.tv"), None);
        classifier
            .add_rule(DomainServiceRule::new("twitch.tv", "Twitch", "video"))
            .await
            .unwrap();
        assert_eq!(service(&classifier, "www.twitch.tv").as_deref(), Some("Twitch"));

        classifier
            .update_rule(DomainServiceRule::new("twitch.tv", "Twitch (Amazon)", "video"))
            .await
            .unwrap();
        assert_eq!(service(&classifier, "www.twitch.tv").as_deref(), Some("Twitch (Amazon)"));

        classifier.delete_rule("twitch.tv").await.unwrap();
        assert_eq!(service(&classifier, "www.twitch.tv"), None);
    }

    #[tokio::test]
    async fn rule_errors() {
        let classifier = classifier(&[("zoom.us", "Zoom")]);

        assert!(matches!(
            classifier.add_rule(DomainServiceRule::new("zoom.us", "Zoom", "video")).await,
            Err(ClassifierError::DuplicatePattern(_))
        ));
        assert!(matches!(
            classifier.delete_rule("teams.ms").await,
            Err(ClassifierError::NotFound(_))
        ));
        assert!(matches!(
            classifier.add_rule(DomainServiceRule::new(" ", "?", "?")).await,
            Err(ClassifierError::EmptyPattern)
        ));
    }

    #[test]
    fn unknown_domains_are_aggregated() {
        let classifier = classifier(&[]);
        let ips: Vec<IpAddr> = (1..=7).map(|n| IpAddr::from([10, 0, 0, n])).collect();

        for ip in &ips {
            classifier.classify_or_record("Odd.Example", *ip);
        }
        classifier.classify_or_record("other.example", ips[0]);
        classifier.classify_or_record("34.216.184.93.in-addr.arpa", ips[0]);

        let unknown = classifier.unknown_domains();
        assert_eq!(unknown.len(), 2);
        assert_eq!(unknown[0].domain, "odd.example");
        assert_eq!(unknown[0].hits, 7);
        assert_eq!(unknown[0].sample_ips.len(), MAX_SAMPLE_IPS);
    }

    #[test]
    fn unknown_domains_are_fifo_bounded() {
        let classifier = DomainServiceClassifier::new(16, 2, None);
        let ip = IpAddr::from([10, 0, 0, 1]);

        classifier.classify_or_record("a.example", ip);
        classifier.classify_or_record("b.example", ip);
        classifier.classify_or_record("c.example", ip);

        let domains: Vec<_> = classifier.unknown_domains().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, ["b.example", "c.example"]);
    }

    #[tokio::test]
    async fn new_rule_purges_matching_unknown_domains() {
        let classifier = classifier(&[]);
        let ip = IpAddr::from([10, 0, 0, 1]);

        classifier.classify_or_record("cdn.discordapp.com", ip);
        classifier.classify_or_record("weather.example", ip);

        classifier
            .add_rule(DomainServiceRule::new("discordapp.com", "Discord", "messaging"))
            .await
            .unwrap();

        let domains: Vec<_> = classifier.unknown_domains().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, ["weather.example"]);
    }

    #[tokio::test]
    async fn rule_changes_are_written_to_the_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("rules.json")).unwrap();

        async fn reloaded(path: &Utf8PathBuf) -> Vec<DomainServiceRule> {
            let restored = DomainServiceClassifier::new(16, 16, Some(path.clone()));
            restored.load().await.unwrap();
            restored.rules()
        }

        let classifier = DomainServiceClassifier::new(16, 16, Some(path.clone()));

        classifier
            .add_rule(DomainServiceRule::new("spotify.com", "Spotify", "music"))
            .await
            .unwrap();
        assert_eq!(reloaded(&path).await, classifier.rules());

        classifier
            .update_rule(DomainServiceRule::new("spotify.com", "Spotify", "audio"))
            .await
            .unwrap();
        assert_eq!(reloaded(&path).await[0].category, "audio");

        let imported = classifier
            .import_rules([DomainServiceRule::new("netflix.com", "Netflix", "video")])
            .await
            .unwrap();
        assert_eq!(imported, 1);
        assert_eq!(reloaded(&path).await.len(), 2);

        classifier.delete_rule("spotify.com").await.unwrap();
        assert_eq!(reloaded(&path).await, [DomainServiceRule::new("netflix.com", "Netflix", "video")]);
    }

    #[tokio::test]
    async fn rules_file_entries_default_their_role() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("rules.json")).unwrap();

        std::fs::write(
            &path,
            r#"[{ "pattern": "spotify.com", "service": "Spotify", "category": "music" }, { "pattern": "scdn", "service": "Spotify CDN", "category": "music", "role": "cdn" }]"#,
        )
        .unwrap();

        let restored = DomainServiceClassifier::new(16, 16, Some(path));
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.classify("open.spotify.com").unwrap().role, "primary");
        assert_eq!(restored.classify("i.scdn.co").unwrap().role, "cdn");
    }
}
