use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::asn::{AsnLookup, AsnResolver, CymruAsnLookup};
use crate::classifier::DomainServiceClassifier;
use crate::config::Conf;
use crate::dns_cache::DnsCache;
use crate::ptr::{PtrResolver, ReverseLookup};
use crate::resolver::DnsClient;
use crate::threat::ThreatIntel;

/// Enrichment stores shared by the capture sessions.
///
/// Built once by the service; outlives every capture session.
#[derive(Clone)]
pub struct Pipeline {
    pub dns: Arc<DnsCache>,
    pub ptr: Arc<PtrResolver>,
    pub asn: Arc<AsnResolver>,
    pub threats: Arc<ThreatIntel>,
    pub classifier: Arc<DomainServiceClassifier>,
    dns_file: Option<Utf8PathBuf>,
}

/// Network backends of the resolvers.
pub struct Backends {
    pub reverse: Arc<dyn ReverseLookup>,
    pub asn: Box<dyn AsnLookup>,
}

impl Backends {
    pub fn system(conf: &Conf) -> Self {
        let ptr_client = DnsClient::from_system_conf(Duration::from_millis(conf.caches.ptr_timeout_ms));
        let asn_client = DnsClient::from_system_conf(Duration::from_millis(conf.caches.asn_timeout_ms));

        Self {
            reverse: Arc::new(ptr_client),
            asn: Box::new(CymruAsnLookup::new(asn_client)),
        }
    }
}

impl Pipeline {
    /// `persist` enables the on-disk snapshots of the stores.
    pub fn new(conf: &Conf, backends: Backends, persist: bool) -> Self {
        let caches = &conf.caches;

        let dns = Arc::new(DnsCache::new(caches.dns_max_entries));

        let ptr = Arc::new(PtrResolver::new(
            Arc::clone(&dns),
            backends.reverse,
            caches.ptr_queue_capacity,
        ));

        let asn = Arc::new(AsnResolver::new(
            backends.asn,
            caches.asn_max_entries,
            Duration::from_secs(caches.asn_ttl_secs),
            caches.asn_persist_every,
            persist.then(|| caches.asn_file.clone()),
        ));

        let threats = Arc::new(ThreatIntel::new(&conf.threat, persist));

        let classifier = Arc::new(DomainServiceClassifier::new(
            caches.classifier_cache_size,
            caches.unknown_domains_max,
            persist.then(|| conf.service_rules_file.clone()),
        ));

        Self {
            dns,
            ptr,
            asn,
            threats,
            classifier,
            dns_file: persist.then(|| caches.dns_file.clone()),
        }
    }

    /// Restores the state saved by a previous run; failures are logged and leave the store empty.
    pub async fn load(&self) {
        if let Some(dns_file) = &self.dns_file {
            match self.dns.load(dns_file).await {
                Ok(count) => debug!(count, "Restored DNS cache"),
                Err(error) => warn!(error = format!("{error:#}"), "Failed to restore DNS cache"),
            }
        }

        match self.asn.load().await {
            Ok(count) => debug!(count, "Restored ASN cache"),
            Err(error) => warn!(error = format!("{error:#}"), "Failed to restore ASN cache"),
        }

        if let Err(error) = self.threats.load().await {
            warn!(error = format!("{error:#}"), "Failed to restore threat lists");
        }

        match self.classifier.load().await {
            Ok(count) => info!(count, "Loaded service rules"),
            Err(error) => warn!(error = format!("{error:#}"), "Failed to load service rules"),
        }
    }

    /// Saves the DNS and ASN caches.
    pub async fn persist_caches(&self) {
        self.persist_dns_cache().await;

        if let Err(error) = self.asn.save().await {
            warn!(error = format!("{error:#}"), "Failed to persist ASN cache");
        }
    }

    pub async fn persist_dns_cache(&self) {
        let Some(dns_file) = &self.dns_file else {
            return;
        };

        if let Err(error) = self.dns.save(dns_file).await {
            warn!(error = format!("{error:#}"), "Failed to persist DNS cache");
        }
    }
}
