#![allow(dead_code)]

use std::io::Read as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use edgetap::asn::AsnLookup;
use edgetap::capture::CaptureManager;
use edgetap::config::{Conf, ConfHandle};
use edgetap::delivery::{BatchSink, DeliveryError, EncodedBatch};
use edgetap::event::TrafficEvent;
use edgetap::parser::FIELDS;
use edgetap::pipeline::{Backends, Pipeline};
use edgetap::ptr::ReverseLookup;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use tempfile::TempDir;

pub struct NoReverse;

#[async_trait]
impl ReverseLookup for NoReverse {
    async fn reverse(&self, _: IpAddr) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Answers every reverse lookup with the same name.
pub struct FixedReverse(pub &'static str);

#[async_trait]
impl ReverseLookup for FixedReverse {
    async fn reverse(&self, _: IpAddr) -> anyhow::Result<Option<String>> {
        Ok(Some(self.0.to_owned()))
    }
}

/// Every public address belongs to Google's AS.
pub struct GoogleAsn;

#[async_trait]
impl AsnLookup for GoogleAsn {
    async fn origin(&self, _: IpAddr) -> anyhow::Result<Option<u32>> {
        Ok(Some(15169))
    }

    async fn organization(&self, _: u32) -> anyhow::Result<Option<String>> {
        Ok(Some("GOOGLE, US".to_owned()))
    }
}

/// Collects delivered events; the first `fail_first` attempts are rejected.
#[derive(Default)]
pub struct RecordingSink {
    pub fail_first: AtomicUsize,
    pub attempts: AtomicUsize,
    pub batches: Mutex<Vec<Vec<TrafficEvent>>>,
}

impl RecordingSink {
    pub fn failing(times: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TrafficEvent> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn send(&self, batch: EncodedBatch) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        }

        let text = if batch.gzip {
            let mut text = String::new();
            GzDecoder::new(batch.body.as_ref()).read_to_string(&mut text).unwrap();
            text
        } else {
            String::from_utf8(batch.body.to_vec()).unwrap()
        };

        let events: Vec<TrafficEvent> = text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(events.len(), batch.count);

        self.batches.lock().push(events);

        Ok(())
    }
}

/// One helper output line from `(field index, value)` pairs.
pub fn line(fields: &[(usize, &str)]) -> String {
    let mut values = vec![""; FIELDS.len()];
    for (index, value) in fields {
        values[*index] = *value;
    }
    values.join("|")
}

pub struct Harness {
    pub dir: TempDir,
    pub conf: Conf,
}

impl Harness {
    /// `rooms_json` is the content of the `Rooms` section.
    pub fn new(rooms_json: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let json = format!(r#"{{ "Rooms": {rooms_json}, "Delivery": {{ "Gzip": true }} }}"#);
        let conf = (*ConfHandle::from_json(&json, &data_dir).unwrap().get_conf()).clone();

        Self { dir, conf }
    }

    /// Uses a shell script printing `lines` as capture helper.
    ///
    /// With `keep_running`, the script then sleeps like a live capture would.
    pub fn fake_helper(&mut self, lines: &[String], keep_running: bool) {
        let output = lines.iter().map(|line| format!("{line}\n")).collect::<String>();
        self.fake_helper_raw(output.as_bytes(), keep_running);
    }

    /// Like [`Harness::fake_helper`], with the exact bytes the helper prints.
    pub fn fake_helper_raw(&mut self, output: &[u8], keep_running: bool) {
        let fixture = self.dir.path().join("capture.txt");
        std::fs::write(&fixture, output).unwrap();

        let tail = if keep_running { "exec sleep 30" } else { "echo 'capture device vanished' >&2; exit 1" };
        let script = format!("cat '{}'; {tail}", fixture.display());

        self.conf.capture.helper_path = Utf8PathBuf::from("sh");
        self.conf.capture.helper_args = vec!["-c".to_owned(), script, "fake-helper".to_owned()];
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(Arc::new(NoReverse))
    }

    pub fn pipeline_with(&self, reverse: Arc<dyn ReverseLookup>) -> Pipeline {
        let backends = Backends {
            reverse,
            asn: Box::new(GoogleAsn),
        };

        Pipeline::new(&self.conf, backends, false)
    }

    pub fn manager(&self, sink: Option<Arc<dyn BatchSink>>) -> CaptureManager {
        CaptureManager::new(Arc::new(self.conf.clone()), self.pipeline(), sink)
    }
}

/// Polls `condition` until it holds, panics after ten seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A DNS answer to the monitored host followed by its TLS connection.
pub fn youtube_session() -> Vec<String> {
    vec![
        line(&[
            (0, "1700000000.1"),
            (1, "8.8.8.8"),
            (2, "192.168.1.10"),
            (4, "53"),
            (5, "17"),
            (6, "www.youtube.com"),
            (7, "142.250.196.110"),
        ]),
        line(&[
            (0, "1700000000.2"),
            (1, "192.168.1.10"),
            (2, "142.250.196.110"),
            (3, "443"),
            (5, "6"),
        ]),
    ]
}

pub fn tcp_syns(count: usize) -> Vec<String> {
    (0..count)
        .map(|n| {
            let dst = format!("203.0.114.{}", n % 250 + 1);
            let epoch = format!("1700000000.{n:03}");
            line(&[(0, epoch.as_str()), (1, "192.168.1.10"), (2, dst.as_str()), (3, "443"), (5, "6")])
        })
        .collect()
}
