use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bounded_lru::BoundedLru;
use camino::Utf8Path;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::persist;

/// IP → domain mapping learned from DNS answers and reverse lookups.
pub struct DnsCache {
    entries: Mutex<BoundedLru<IpAddr, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DnsCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// On-disk layout: entries from least to most recently used.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(IpAddr, String)>,
}

impl DnsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedLru::new(max_entries)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Records `ip → domain`, making the entry the most recently used.
    pub fn add(&self, ip: IpAddr, domain: &str) {
        let Some(domain) = normalize_domain(domain) else {
            return;
        };

        if let Some((evicted, _)) = self.entries.lock().put(ip, domain) {
            trace!(%evicted, "DNS cache full, evicted oldest entry");
        }
    }

    /// Records every address of a comma separated list, returns how many were valid.
    pub fn add_multiple(&self, ips: &str, domain: &str) -> usize {
        let Some(domain) = normalize_domain(domain) else {
            return 0;
        };

        let mut entries = self.entries.lock();
        let mut added = 0;

        for ip in ips.split(',').filter_map(|ip| ip.trim().parse::<IpAddr>().ok()) {
            entries.put(ip, domain.clone());
            added += 1;
        }

        added
    }

    /// Looks up `ip`, making the entry the most recently used.
    pub fn get(&self, ip: IpAddr) -> Option<String> {
        let domain = self.entries.lock().get(&ip).cloned();

        if domain.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        domain
    }

    /// Like `get` but neither touches the entry nor counts.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.lock().contains(&ip)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> DnsCacheStats {
        let entries = self.entries.lock();

        DnsCacheStats {
            entries: entries.len(),
            capacity: entries.capacity(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn save(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            entries: self
                .entries
                .lock()
                .iter()
                .map(|(ip, domain)| (*ip, domain.clone()))
                .collect(),
        };

        persist::save_json(path, &snapshot).await?;

        debug!(%path, entries = snapshot.entries.len(), "DNS cache saved");

        Ok(())
    }

    /// Merges a snapshot into the cache, keeping its recency order; returns how many entries were read.
    pub async fn load(&self, path: &Utf8Path) -> anyhow::Result<usize> {
        let Some(snapshot) = persist::load_json::<Snapshot>(path).await? else {
            return Ok(0);
        };

        let count = snapshot.entries.len();
        self.entries.lock().extend(snapshot.entries);

        debug!(%path, entries = count, "DNS cache loaded");

        Ok(count)
    }
}

/// Lowercase, without the trailing root dot.
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.');

    if domain.is_empty() {
        None
    } else {
        Some(domain.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, n])
    }

    #[test]
    fn oldest_entry_evicted_first() {
        let cache = DnsCache::new(3);

        for n in 1..=4 {
            cache.add(ip(n), &format!("host{n}.example"));
        }

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(ip(1)));
        assert!(cache.contains(ip(4)));
    }

    #[test]
    fn touched_entry_survives() {
        let cache = DnsCache::new(3);

        for n in 1..=3 {
            cache.add(ip(n), "a.example");
        }

        assert!(cache.get(ip(1)).is_some());
        cache.add(ip(4), "b.example");

        assert!(cache.contains(ip(1)));
        assert!(!cache.contains(ip(2)));
    }

    #[test]
    fn add_multiple_skips_garbage() {
        let cache = DnsCache::new(10);

        let added = cache.add_multiple("1.1.1.1, nope,2606:4700::1111", "One.One.One.One.");

        assert_eq!(added, 2);
        assert_eq!(cache.get("1.1.1.1".parse().unwrap()).as_deref(), Some("one.one.one.one"));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = DnsCache::new(10);
        cache.add(ip(1), "a.example");

        cache.get(ip(1));
        cache.get(ip(2));
        cache.get(ip(2));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn snapshot_preserves_recency() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("dns.json")).unwrap();

        let cache = DnsCache::new(3);
        for n in 1..=3 {
            cache.add(ip(n), &format!("h{n}.example"));
        }
        cache.get(ip(1));
        cache.save(&path).await.unwrap();

        let restored = DnsCache::new(3);
        assert_eq!(restored.load(&path).await.unwrap(), 3);

        // 2 is now the oldest entry.
        restored.add(ip(9), "new.example");
        assert!(!restored.contains(ip(2)));
        assert!(restored.contains(ip(1)));
    }
}
