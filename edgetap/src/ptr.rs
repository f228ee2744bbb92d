//! Reverse lookups filling the DNS cache for destinations never seen in a DNS answer.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use edgetap_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::dns_cache::DnsCache;
use crate::ip_utils;
use crate::resolver::DnsClient;

#[async_trait]
pub trait ReverseLookup: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> anyhow::Result<Option<String>>;
}

#[async_trait]
impl ReverseLookup for DnsClient {
    async fn reverse(&self, ip: IpAddr) -> anyhow::Result<Option<String>> {
        DnsClient::reverse(self, ip).await
    }
}

/// Long-lived part of the reverse resolver: counters, pending set and lookup backend.
///
/// A fresh queue and worker are created for every capture session with [`PtrResolver::session`].
pub struct PtrResolver {
    dns: Arc<DnsCache>,
    lookup: Arc<dyn ReverseLookup>,
    queue_capacity: usize,
    pending: Mutex<HashSet<IpAddr>>,
    submitted: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PtrStats {
    pub pending: usize,
    pub submitted: u64,
    pub resolved: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    AlreadyPending,
    /// Known address or not worth a lookup
    Skipped,
    QueueFull,
    Closed,
}

impl PtrResolver {
    pub fn new(dns: Arc<DnsCache>, lookup: Arc<dyn ReverseLookup>, queue_capacity: usize) -> Self {
        Self {
            dns,
            lookup,
            queue_capacity: queue_capacity.max(1),
            pending: Mutex::new(HashSet::new()),
            submitted: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates the bounded queue of a capture session and the worker draining it.
    pub fn session(self: &Arc<Self>) -> (PtrSubmitter, PtrWorkerTask) {
        self.pending.lock().clear();

        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let submitter = PtrSubmitter {
            tx,
            resolver: Arc::clone(self),
        };

        let worker = PtrWorkerTask {
            rx,
            resolver: Arc::clone(self),
        };

        (submitter, worker)
    }

    pub fn stats(&self) -> PtrStats {
        PtrStats {
            pending: self.pending.lock().len(),
            submitted: self.submitted.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    #[instrument(skip(self))]
    async fn process(&self, ip: IpAddr) {
        if !self.dns.contains(ip) {
            match self.lookup.reverse(ip).await {
                Ok(Some(domain)) => {
                    trace!(%ip, %domain, "Reverse lookup succeeded");
                    self.dns.add(ip, &domain);
                    self.resolved.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    trace!(%ip, error = format!("{error:#}"), "Reverse lookup failed");
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.pending.lock().remove(&ip);
    }
}

/// Producer side used by the line parser.
#[derive(Clone)]
pub struct PtrSubmitter {
    tx: mpsc::Sender<IpAddr>,
    resolver: Arc<PtrResolver>,
}

impl PtrSubmitter {
    /// Queues a lookup unless one is already pending; never waits.
    pub fn submit(&self, ip: IpAddr) -> SubmitOutcome {
        if !ip_utils::is_public(ip) || self.resolver.dns.contains(ip) {
            return SubmitOutcome::Skipped;
        }

        let mut pending = self.resolver.pending.lock();

        if pending.contains(&ip) {
            return SubmitOutcome::AlreadyPending;
        }

        match self.tx.try_send(ip) {
            Ok(()) => {
                pending.insert(ip);
                self.resolver.submitted.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.resolver.dropped.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitOutcome::Closed,
        }
    }
}

pub struct PtrWorkerTask {
    rx: mpsc::Receiver<IpAddr>,
    resolver: Arc<PtrResolver>,
}

#[async_trait]
impl Task for PtrWorkerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "ptr resolver";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        debug!("Task started");

        loop {
            tokio::select! {
                ip = self.rx.recv() => {
                    let Some(ip) = ip else {
                        break;
                    };

                    self.resolver.process(ip).await;
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        self.rx.close();
        while let Ok(ip) = self.rx.try_recv() {
            self.resolver.pending.lock().remove(&ip);
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use edgetap_task::ShutdownHandle;
    use tokio::sync::Notify;

    use super::*;

    struct StaticLookup;

    #[async_trait]
    impl ReverseLookup for StaticLookup {
        async fn reverse(&self, ip: IpAddr) -> anyhow::Result<Option<String>> {
            match ip.to_string().as_str() {
                "93.184.216.34" => Ok(Some("edge.example.net.".to_owned())),
                "1.1.1.1" => Ok(None),
                _ => anyhow::bail!("SERVFAIL"),
            }
        }
    }

    /// Blocks every lookup until released.
    struct GatedLookup(Arc<Notify>);

    #[async_trait]
    impl ReverseLookup for GatedLookup {
        async fn reverse(&self, _: IpAddr) -> anyhow::Result<Option<String>> {
            self.0.notified().await;
            Ok(None)
        }
    }

    fn resolver(lookup: Arc<dyn ReverseLookup>, capacity: usize) -> (Arc<DnsCache>, Arc<PtrResolver>) {
        let dns = Arc::new(DnsCache::new(100));
        let resolver = Arc::new(PtrResolver::new(Arc::clone(&dns), lookup, capacity));
        (dns, resolver)
    }

    #[test]
    fn duplicate_submission_queues_one_job() {
        let (_dns, resolver) = resolver(Arc::new(StaticLookup), 10);
        let (submitter, _worker) = resolver.session();
        let ip = "93.184.216.34".parse().unwrap();

        assert_eq!(submitter.submit(ip), SubmitOutcome::Queued);
        assert_eq!(submitter.submit(ip), SubmitOutcome::AlreadyPending);

        let stats = resolver.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (_dns, resolver) = resolver(Arc::new(StaticLookup), 1);
        let (submitter, _worker) = resolver.session();

        assert_eq!(submitter.submit("8.8.8.8".parse().unwrap()), SubmitOutcome::Queued);
        assert_eq!(submitter.submit("8.8.4.4".parse().unwrap()), SubmitOutcome::QueueFull);

        let stats = resolver.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn private_and_known_addresses_are_skipped() {
        let (dns, resolver) = resolver(Arc::new(StaticLookup), 10);
        let (submitter, _worker) = resolver.session();

        dns.add("8.8.8.8".parse().unwrap(), "dns.google");

        assert_eq!(submitter.submit("192.168.1.20".parse().unwrap()), SubmitOutcome::Skipped);
        assert_eq!(submitter.submit("8.8.8.8".parse().unwrap()), SubmitOutcome::Skipped);
    }

    #[tokio::test]
    async fn worker_fills_cache_and_clears_pending() {
        let (dns, resolver) = resolver(Arc::new(StaticLookup), 10);
        let (submitter, worker) = resolver.session();
        let (handle, signal) = ShutdownHandle::new();
        let task = edgetap_task::spawn_task(worker, signal);

        submitter.submit("93.184.216.34".parse().unwrap());
        submitter.submit("1.1.1.1".parse().unwrap());
        submitter.submit("9.9.9.9".parse().unwrap());

        tokio::time::timeout(Duration::from_secs(5), async {
            while resolver.stats().pending > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(dns.get("93.184.216.34".parse().unwrap()).as_deref(), Some("edge.example.net"));

        let stats = resolver.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.failed, 2);

        handle.signal();
        task.join().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pending_is_released_after_processing() {
        let gate = Arc::new(Notify::new());
        let (_dns, resolver) = resolver(Arc::new(GatedLookup(Arc::clone(&gate))), 10);
        let (submitter, worker) = resolver.session();
        let (handle, signal) = ShutdownHandle::new();
        let task = edgetap_task::spawn_task(worker, signal);

        let ip = "8.8.8.8".parse().unwrap();
        assert_eq!(submitter.submit(ip), SubmitOutcome::Queued);
        assert_eq!(submitter.submit(ip), SubmitOutcome::AlreadyPending);

        gate.notify_one();

        tokio::time::timeout(Duration::from_secs(5), async {
            while resolver.stats().pending > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(submitter.submit(ip), SubmitOutcome::Queued);

        handle.signal();
        drop(task);
    }
}
