//! Batch encoding and posting to the collector.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write as _;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt as _;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::asn::{AsnResolver, classify_asn};
use crate::config::dto::DeliveryConf;
use crate::event::TrafficEvent;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Concurrent ASN lookups while enriching one batch.
const ENRICHMENT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Bytes,
    pub gzip: bool,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to post batch")]
    Request(#[from] reqwest::Error),
    #[error("collector responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to encode batch")]
    Encode(#[source] anyhow::Error),
}

/// One event per line, optionally gzipped.
pub fn encode_batch(events: &[TrafficEvent], gzip: bool) -> anyhow::Result<EncodedBatch> {
    let mut ndjson = Vec::with_capacity(events.len() * 256);

    for event in events {
        serde_json::to_writer(&mut ndjson, event).context("failed to serialize event")?;
        ndjson.push(b'\n');
    }

    let body = if gzip {
        let mut encoder = GzEncoder::new(Vec::with_capacity(ndjson.len() / 4), Compression::default());
        encoder.write_all(&ndjson).context("gzip write")?;
        encoder.finish().context("gzip finish")?
    } else {
        ndjson
    };

    Ok(EncodedBatch {
        body: Bytes::from(body),
        gzip,
        count: events.len(),
    })
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send(&self, batch: EncodedBatch) -> Result<(), DeliveryError>;
}

pub struct HttpBatchSink {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
}

impl HttpBatchSink {
    pub fn new(endpoint: Url, conf: &DeliveryConf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        let headers = build_headers(&conf.headers)?;

        Ok(Self {
            client,
            endpoint,
            headers,
        })
    }
}

fn build_headers(extra: &BTreeMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value).with_context(|| format!("invalid value for header {name}"))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    async fn send(&self, batch: EncodedBatch) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE);

        if batch.gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.body(batch.body).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status))
        }
    }
}

/// Fills the ASN fields of a batch copy; each distinct address is looked up once.
///
/// Service and category already set by the domain classifier are kept.
pub async fn enrich_with_asn(events: &mut [TrafficEvent], asn: &AsnResolver) {
    let addresses: HashSet<IpAddr> = events
        .iter()
        .filter(|event| event.asn.is_none())
        .filter_map(|event| event.dst_ip)
        .collect();

    if addresses.is_empty() {
        return;
    }

    let results: HashMap<IpAddr, (Option<u32>, Option<String>)> = futures::stream::iter(addresses)
        .map(|ip| async move { (ip, asn.lookup(ip).await) })
        .buffer_unordered(ENRICHMENT_CONCURRENCY)
        .collect()
        .await;

    for event in events.iter_mut().filter(|event| event.asn.is_none()) {
        let Some((number, org)) = event.dst_ip.and_then(|ip| results.get(&ip)) else {
            continue;
        };

        event.asn = *number;

        if event.asn_service.is_none() {
            let (service, category) = classify_asn(*number, org.as_deref());
            event.asn_service = service;
            event.asn_category = category;
        }
    }
}
