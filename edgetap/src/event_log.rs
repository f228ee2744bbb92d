//! Local retention of events as JSON lines.
//!
//! A single task owns the files; the capture read loop reaches it through a bounded channel and
//! never waits on it: when the channel is full the event is not logged and the drop is counted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use edgetap_task::{ShutdownSignal, Task};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt as _, BufWriter};
use tokio::sync::mpsc;

use crate::config::dto::EventLogConf;
use crate::event::TrafficEvent;

const FILE_PREFIX: &str = "events-";
const FILE_SUFFIX: &str = ".jsonl";
const CHANNEL_CAPACITY: usize = 1024;

const FILE_TIME_FORMAT: &[FormatItem<'static>] = format_description!("[year][month][day]-[hour][minute][second]");

#[derive(Debug, Default)]
pub struct EventLogCounters {
    written: AtomicU64,
    dropped: AtomicU64,
    rotations: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventLogStats {
    pub written: u64,
    pub dropped: u64,
    pub rotations: u64,
    pub errors: u64,
}

impl EventLogCounters {
    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct CurrentFile {
    path: Utf8PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

/// Appends events to size-capped files, deleting the oldest ones to respect the directory cap.
pub struct EventLogWriter {
    directory: Utf8PathBuf,
    max_file_bytes: u64,
    max_total_bytes: u64,
    /// Closed files, oldest first
    closed: VecDeque<(Utf8PathBuf, u64)>,
    current: CurrentFile,
    counters: Arc<EventLogCounters>,
}

impl EventLogWriter {
    pub async fn open(conf: &EventLogConf, counters: Arc<EventLogCounters>) -> anyhow::Result<Self> {
        let directory = conf.directory.clone();

        fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("failed to create {directory}"))?;

        let closed = scan_existing(&directory).await?;
        let current = create_file(&directory).await?;

        debug!(path = %current.path, existing = closed.len(), "Event log opened");

        let mut writer = Self {
            directory,
            max_file_bytes: conf.max_file_bytes.max(1),
            max_total_bytes: conf.max_total_bytes.max(1),
            closed,
            current,
            counters,
        };

        writer.prune(0).await;

        Ok(writer)
    }

    pub fn current_path(&self) -> &Utf8Path {
        &self.current.path
    }

    pub async fn append(&mut self, event: &TrafficEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event).context("failed to serialize event")?;
        line.push(b'\n');

        let len = line.len() as u64;

        if self.current.size > 0 && self.current.size + len > self.max_file_bytes {
            self.rotate().await?;
        }

        self.prune(len).await;

        self.current
            .writer
            .write_all(&line)
            .await
            .with_context(|| format!("failed to write to {}", self.current.path))?;

        self.current.size += len;
        self.counters.written.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.current
            .writer
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.current.path))
    }

    async fn rotate(&mut self) -> anyhow::Result<()> {
        self.flush().await?;

        let next = create_file(&self.directory).await?;
        let previous = std::mem::replace(&mut self.current, next);

        debug!(previous = %previous.path, next = %self.current.path, "Event log rotated");

        self.closed.push_back((previous.path, previous.size));
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.closed.iter().map(|(_, size)| size).sum::<u64>() + self.current.size
    }

    /// Deletes the oldest closed files until `incoming` more bytes fit under the total cap.
    async fn prune(&mut self, incoming: u64) {
        while self.total_bytes() + incoming > self.max_total_bytes {
            let Some((path, _)) = self.closed.pop_front() else {
                break;
            };

            match fs::remove_file(&path).await {
                Ok(()) => info!(%path, "Deleted old event log file"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => warn!(%path, %error, "Couldn't delete event log file"),
            }
        }
    }
}

async fn scan_existing(directory: &Utf8Path) -> anyhow::Result<VecDeque<(Utf8PathBuf, u64)>> {
    let mut read_dir = fs::read_dir(directory)
        .await
        .with_context(|| format!("failed to read {directory}"))?;

    let mut files = Vec::new();

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        if !(file_name.starts_with(FILE_PREFIX) && file_name.ends_with(FILE_SUFFIX)) {
            continue;
        }

        match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => {
                let modified = metadata.modified().ok();
                files.push((modified, directory.join(&file_name), metadata.len()));
            }
            Ok(_) => {}
            Err(error) => warn!(file_name, %error, "Couldn't retrieve metadata for file"),
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    Ok(files.into_iter().map(|(_, path, size)| (path, size)).collect())
}

async fn create_file(directory: &Utf8Path) -> anyhow::Result<CurrentFile> {
    let stamp = OffsetDateTime::now_utc()
        .format(FILE_TIME_FORMAT)
        .context("failed to format file name")?;

    let mut path = directory.join(format!("{FILE_PREFIX}{stamp}{FILE_SUFFIX}"));
    let mut counter = 1;

    while fs::try_exists(&path).await.unwrap_or(false) {
        path = directory.join(format!("{FILE_PREFIX}{stamp}-{counter}{FILE_SUFFIX}"));
        counter += 1;
    }

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open {path}"))?;

    Ok(CurrentFile {
        path,
        writer: BufWriter::new(file),
        size: 0,
    })
}

/// Producer side of the event log.
#[derive(Clone)]
pub struct EventLogHandle {
    tx: mpsc::Sender<Arc<TrafficEvent>>,
    counters: Arc<EventLogCounters>,
}

impl EventLogHandle {
    /// Queues the event for writing; returns `false` if it was dropped.
    pub fn try_write(&self, event: Arc<TrafficEvent>) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

pub struct EventLogTask {
    writer: EventLogWriter,
    rx: mpsc::Receiver<Arc<TrafficEvent>>,
}

impl EventLogTask {
    pub fn new(writer: EventLogWriter) -> (EventLogHandle, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let handle = EventLogHandle {
            tx,
            counters: Arc::clone(&writer.counters),
        };

        (handle, Self { writer, rx })
    }

    async fn write(&mut self, event: &TrafficEvent) {
        if let Err(error) = self.writer.append(event).await {
            self.writer.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = format!("{error:#}"), "Failed to write event log");
        }
    }
}

#[async_trait]
impl Task for EventLogTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "event log";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        debug!(path = %self.writer.current_path(), "Task started");

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };

                    self.write(&event).await;

                    while let Ok(event) = self.rx.try_recv() {
                        self.write(&event).await;
                    }

                    if let Err(error) = self.writer.flush().await {
                        warn!(error = format!("{error:#}"), "Failed to flush event log");
                    }
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        // Write what was queued before the shutdown.
        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.write(&event).await;
        }

        self.writer.flush().await?;

        debug!("Task terminated");

        Ok(())
    }
}
