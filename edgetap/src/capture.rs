//! Capture session lifecycle: helper process, read loop and flush loop.
//!
//! A session is everything started by [`CaptureManager::start`]: the capture helper process
//! plus the tasks consuming its output. The send queue and display buffer outlive sessions so
//! that events captured before a restart are still delivered.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use edgetap_task::{ShutdownSignal, Task, TaskOutcome, TaskSet};
use parking_lot::Mutex;
use time::{OffsetDateTime, UtcOffset};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::Conf;
use crate::config::dto::{CaptureConf, DeliveryConf};
use crate::delivery::{BatchSink, DeliveryError, encode_batch, enrich_with_asn};
use crate::event::TrafficEvent;
use crate::event_log::{EventLogCounters, EventLogHandle, EventLogTask, EventLogWriter};
use crate::filter::{CaptureMode, build_filter};
use crate::parser::{FIELDS, LineParser, SEPARATOR};
use crate::pipeline::Pipeline;
use crate::ptr::PtrSubmitter;
use crate::queue::BoundedQueue;
use crate::rooms::{ExpandedRooms, RoomPolicy};
use crate::status::{CaptureState, CaptureStatus};

const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const HELPER_TERMINATE_GRACE: Duration = Duration::from_secs(3);
const FLUSH_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("room policy is empty, nothing to capture")]
    EmptyPolicy,
    #[error("capture is already running")]
    AlreadyRunning,
    #[error("capture is disabled in configuration")]
    Disabled,
    #[error("failed to launch the capture helper")]
    Spawn(#[source] io::Error),
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    /// Accepted by the collector.
    Sent(usize),
    /// Dequeued without network call (dry run or no endpoint).
    Discarded(usize),
    /// The batch stays at the head of the queue.
    Failed,
}

pub struct CaptureManager {
    conf: Arc<Conf>,
    pipeline: Pipeline,
    rooms: Mutex<RoomPolicy>,
    delivery: Arc<Delivery>,
    shared: Arc<Shared>,
    event_log_counters: Arc<EventLogCounters>,
    session: tokio::sync::Mutex<Option<Session>>,
}

struct Session {
    tasks: TaskSet<anyhow::Result<()>>,
    helper: Child,
}

struct Delivery {
    sink: Option<Arc<dyn BatchSink>>,
    dry_run: bool,
    conf: DeliveryConf,
    pipeline: Pipeline,
}

struct SessionInfo {
    filter: String,
    started_at: OffsetDateTime,
}

/// State shared between the manager and the session tasks.
struct Shared {
    state: Mutex<CaptureState>,
    send_queue: Mutex<BoundedQueue<Arc<TrafficEvent>>>,
    display: Mutex<BoundedQueue<Arc<TrafficEvent>>>,
    // Serializes delivery attempts of the flush loop and `flush_remaining`.
    delivery_lock: tokio::sync::Mutex<()>,
    sent: AtomicU64,
    delivery_failures: AtomicU64,
    lines_read: AtomicU64,
    malformed_lines: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_send_ok_at: Mutex<Option<OffsetDateTime>>,
    helper_stderr_tail: Mutex<Option<String>>,
    session_info: Mutex<Option<SessionInfo>>,
}

impl Shared {
    fn new(capture: &CaptureConf) -> Self {
        Self {
            state: Mutex::new(CaptureState::Stopped),
            send_queue: Mutex::new(BoundedQueue::new(capture.send_queue_max)),
            display: Mutex::new(BoundedQueue::new(capture.display_buffer_max)),
            delivery_lock: tokio::sync::Mutex::new(()),
            sent: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            lines_read: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_send_ok_at: Mutex::new(None),
            helper_stderr_tail: Mutex::new(None),
            session_info: Mutex::new(None),
        }
    }

    fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    fn set_state(&self, state: CaptureState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);

        if previous != state {
            debug!(?previous, ?state, "Capture state changed");
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn enqueue(&self, event: Arc<TrafficEvent>) {
        self.display.lock().push(Arc::clone(&event));

        let dropped = self.send_queue.lock().push(event);
        if dropped > 0 {
            trace!(dropped, "Send queue full, oldest events evicted");
        }
    }

    fn on_helper_exit(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, CaptureState::Running | CaptureState::Starting) {
                *state = CaptureState::Stopped;
            }
        }

        let message = match self.helper_stderr_tail.lock().as_deref() {
            Some(tail) => format!("{reason}: {tail}"),
            None => reason.to_owned(),
        };

        error!(error = %message, "Capture helper stopped unexpectedly");
        self.record_error(message);
    }

    fn on_delivery_failure(&self, error: DeliveryError) {
        let error = anyhow::Error::new(error);
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = format!("{error:#}"), "Batch delivery failed, will retry");
        self.record_error(format!("{error:#}"));
    }

    /// Attempts to deliver the head of the send queue once.
    #[instrument(skip_all)]
    async fn deliver_once(&self, delivery: &Delivery) -> FlushOutcome {
        let _guard = self.delivery_lock.lock().await;

        let Some(batch) = self.send_queue.lock().head(delivery.conf.max_batch) else {
            return FlushOutcome::Empty;
        };

        let sink = match &delivery.sink {
            Some(sink) if !delivery.dry_run => sink,
            _ => {
                let removed = self.send_queue.lock().remove_through(batch.last_seq);
                self.sent.fetch_add(removed as u64, Ordering::Relaxed);
                trace!(count = removed, "Batch discarded (dry run or no endpoint)");
                return FlushOutcome::Discarded(removed);
            }
        };

        let mut events: Vec<TrafficEvent> = batch.items.iter().map(|event| TrafficEvent::clone(event)).collect();

        if delivery.conf.asn_enrichment {
            enrich_with_asn(&mut events, &delivery.pipeline.asn).await;
        }

        let encoded = match encode_batch(&events, delivery.conf.gzip) {
            Ok(encoded) => encoded,
            Err(error) => {
                self.on_delivery_failure(DeliveryError::Encode(error));
                return FlushOutcome::Failed;
            }
        };

        let count = encoded.count;

        match sink.send(encoded).await {
            Ok(()) => {
                let removed = self.send_queue.lock().remove_through(batch.last_seq);
                self.sent.fetch_add(count as u64, Ordering::Relaxed);
                *self.last_send_ok_at.lock() = Some(OffsetDateTime::now_utc());
                debug!(count, removed, "Batch delivered");
                FlushOutcome::Sent(count)
            }
            Err(error) => {
                self.on_delivery_failure(error);
                FlushOutcome::Failed
            }
        }
    }
}

impl CaptureManager {
    /// `sink` is `None` when no collector endpoint is configured.
    pub fn new(conf: Arc<Conf>, pipeline: Pipeline, sink: Option<Arc<dyn BatchSink>>) -> Self {
        let delivery = Delivery {
            sink,
            dry_run: conf.capture.dry_run,
            conf: conf.delivery.clone(),
            pipeline: pipeline.clone(),
        };

        Self {
            rooms: Mutex::new(conf.rooms.clone()),
            shared: Arc::new(Shared::new(&conf.capture)),
            delivery: Arc::new(delivery),
            event_log_counters: Arc::new(EventLogCounters::default()),
            session: tokio::sync::Mutex::new(None),
            pipeline,
            conf,
        }
    }

    /// Replaces the room policy; the running capture keeps its filter until restarted.
    pub fn set_room_policy(&self, policy: RoomPolicy) {
        *self.rooms.lock() = policy;
    }

    pub fn room_policy(&self) -> RoomPolicy {
        self.rooms.lock().clone()
    }

    /// Filter the next session would use.
    pub fn current_filter(&self) -> String {
        let expanded = self.rooms.lock().expand();
        build_filter(&expanded, &CaptureMode::from_conf(&self.conf.capture))
    }

    pub async fn start(&self) -> Result<(), StartError> {
        let mut session = self.session.lock().await;
        self.start_locked(&mut session).await
    }

    /// Stops the running session, if any.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;

        if !self.stop_locked(&mut session, CaptureState::Stopped).await {
            debug!("Capture already stopped");
        }
    }

    pub async fn restart(&self) -> Result<(), StartError> {
        let mut session = self.session.lock().await;

        if session.is_some() {
            self.shared.set_state(CaptureState::Restarting);
            self.stop_locked(&mut session, CaptureState::Restarting).await;
        }

        self.start_locked(&mut session).await
    }

    /// Drains what is queued now in `max_batch` chunks, one attempt per chunk.
    ///
    /// Stops at the first failed chunk, which stays queued along with everything behind it.
    pub async fn flush_remaining(&self) -> FlushOutcome {
        let mut budget = self.shared.send_queue.lock().len();
        let mut outcome = FlushOutcome::Empty;

        while budget > 0 {
            let chunk = self.shared.deliver_once(&self.delivery).await;

            outcome = match (outcome, chunk) {
                (_, FlushOutcome::Empty) => break,
                (_, FlushOutcome::Failed) => FlushOutcome::Failed,
                (FlushOutcome::Sent(total), FlushOutcome::Sent(count)) => FlushOutcome::Sent(total + count),
                (FlushOutcome::Discarded(total), FlushOutcome::Discarded(count)) => {
                    FlushOutcome::Discarded(total + count)
                }
                (_, chunk) => chunk,
            };

            match chunk {
                FlushOutcome::Sent(count) | FlushOutcome::Discarded(count) => budget = budget.saturating_sub(count),
                FlushOutcome::Empty | FlushOutcome::Failed => break,
            }
        }

        debug!(?outcome, remaining = self.shared.send_queue.lock().len(), "Final flush");

        outcome
    }

    pub fn status(&self) -> CaptureStatus {
        let state = self.shared.state();

        let (queue_len, queue_capacity, drop_count) = {
            let queue = self.shared.send_queue.lock();
            (queue.len(), queue.capacity(), queue.dropped())
        };

        let (display_len, display_capacity, display_drop_count) = {
            let display = self.shared.display.lock();
            (display.len(), display.capacity(), display.dropped())
        };

        let (filter, started_at) = match self.shared.session_info.lock().as_ref() {
            Some(info) => (Some(info.filter.clone()), Some(info.started_at)),
            None => (None, None),
        };

        CaptureStatus {
            state,
            running: state == CaptureState::Running,
            enabled: self.conf.capture.enabled,
            dry_run: self.conf.capture.dry_run,
            interface: self.conf.capture.interface.clone(),
            filter,
            started_at,
            queue_len,
            queue_capacity,
            display_len,
            display_capacity,
            sent_count: self.shared.sent.load(Ordering::Relaxed),
            drop_count,
            display_drop_count,
            delivery_failures: self.shared.delivery_failures.load(Ordering::Relaxed),
            lines_read: self.shared.lines_read.load(Ordering::Relaxed),
            malformed_lines: self.shared.malformed_lines.load(Ordering::Relaxed),
            last_error: self.shared.last_error.lock().clone(),
            last_send_ok_at: *self.shared.last_send_ok_at.lock(),
            dns_cache: self.pipeline.dns.stats(),
            ptr: self.pipeline.ptr.stats(),
            asn: self.pipeline.asn.stats(),
            threat: self.pipeline.threats.stats(),
            classifier: self.pipeline.classifier.stats(),
            event_log: self.event_log_counters.stats(),
        }
    }

    /// Newest events of the display buffer, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<Arc<TrafficEvent>> {
        self.shared.display.lock().newest(n)
    }

    async fn start_locked(&self, slot: &mut Option<Session>) -> Result<(), StartError> {
        let result = self.try_start(slot).await;

        if result.is_err() && self.shared.state() == CaptureState::Restarting {
            self.shared.set_state(CaptureState::Stopped);
        }

        result
    }

    async fn try_start(&self, slot: &mut Option<Session>) -> Result<(), StartError> {
        if slot.is_some() && matches!(self.shared.state(), CaptureState::Running | CaptureState::Starting) {
            return Err(StartError::AlreadyRunning);
        }

        if !self.conf.capture.enabled {
            return Err(StartError::Disabled);
        }

        let rooms = self.rooms.lock().expand();

        if rooms.is_empty() {
            return Err(StartError::EmptyPolicy);
        }

        // The helper of the previous session exited on its own.
        if let Some(stale) = slot.take() {
            teardown(stale).await;
        }

        self.shared.set_state(CaptureState::Starting);
        *self.shared.helper_stderr_tail.lock() = None;

        let filter = build_filter(&rooms, &CaptureMode::from_conf(&self.conf.capture));

        let mut helper = match helper_command(&self.conf.capture, &filter).spawn() {
            Ok(helper) => helper,
            Err(error) => {
                self.shared.set_state(CaptureState::Stopped);
                self.shared
                    .record_error(format!("failed to launch {}: {error}", self.conf.capture.helper_path));
                return Err(StartError::Spawn(error));
            }
        };

        let Some(stdout) = helper.stdout.take() else {
            self.shared.set_state(CaptureState::Stopped);
            let _ = helper.start_kill();
            return Err(StartError::Spawn(io::Error::other("capture helper stdout is not piped")));
        };

        let stderr = helper.stderr.take();

        let mut tasks = TaskSet::new();

        let (ptr_submitter, ptr_worker) = self.pipeline.ptr.session();
        tasks.register(ptr_worker);

        let event_log = self.start_event_log(&mut tasks).await;

        if let Some(stderr) = stderr {
            tasks.register(HelperStderrTask {
                stderr,
                shared: Arc::clone(&self.shared),
            });
        }

        tasks.register(ReadLoopTask {
            stdout,
            shared: Arc::clone(&self.shared),
            pipeline: self.pipeline.clone(),
            rooms,
            ptr: ptr_submitter,
            event_log,
            utc_offset: self.conf.utc_offset,
        });

        tasks.register(FlushLoopTask {
            shared: Arc::clone(&self.shared),
            delivery: Arc::clone(&self.delivery),
            batch_size: self.conf.delivery.batch_size,
            flush_interval: Duration::from_secs(self.conf.delivery.flush_interval_secs),
            dns_persist_interval: Duration::from_secs(self.conf.caches.dns_persist_interval_secs),
        });

        info!(
            interface = %self.conf.capture.interface,
            pid = helper.id(),
            dry_run = self.conf.capture.dry_run,
            %filter,
            "Capture started"
        );

        *self.shared.session_info.lock() = Some(SessionInfo {
            filter,
            started_at: OffsetDateTime::now_utc(),
        });

        self.shared.set_state(CaptureState::Running);

        *slot = Some(Session { tasks, helper });

        Ok(())
    }

    async fn start_event_log(&self, tasks: &mut TaskSet<anyhow::Result<()>>) -> Option<EventLogHandle> {
        if !self.conf.event_log.enabled {
            return None;
        }

        match EventLogWriter::open(&self.conf.event_log, Arc::clone(&self.event_log_counters)).await {
            Ok(writer) => {
                let (handle, task) = EventLogTask::new(writer);
                tasks.register(task);
                Some(handle)
            }
            Err(error) => {
                warn!(error = format!("{error:#}"), "Event log unavailable for this session");
                None
            }
        }
    }

    /// Returns `false` if there was no session to stop.
    async fn stop_locked(&self, slot: &mut Option<Session>, final_state: CaptureState) -> bool {
        let Some(session) = slot.take() else {
            return false;
        };

        if final_state != CaptureState::Restarting {
            self.shared.set_state(CaptureState::Stopping);
        }

        teardown(session).await;

        self.pipeline.persist_caches().await;

        *self.shared.session_info.lock() = None;
        self.shared.set_state(final_state);

        info!("Capture stopped");

        true
    }
}

#[instrument(skip_all)]
async fn teardown(session: Session) {
    let Session { tasks, mut helper } = session;

    for outcome in tasks.shutdown(TASK_SHUTDOWN_GRACE).await {
        match outcome {
            TaskOutcome::Finished { output: Ok(()), .. } => {}
            TaskOutcome::Finished { name, output: Err(error) } => {
                warn!(task = name, error = format!("{error:#}"), "Task failed");
            }
            TaskOutcome::Panicked { name, error } => {
                error!(task = name, %error, "Task panicked");
            }
            TaskOutcome::Aborted { name } => {
                warn!(task = name, "Task did not stop in time and was aborted");
            }
        }
    }

    terminate_helper(&mut helper, HELPER_TERMINATE_GRACE).await;
}

/// Arguments passed to the capture helper, configured leading arguments first.
pub fn helper_args(conf: &CaptureConf, filter: &str) -> Vec<String> {
    let mut args = conf.helper_args.clone();

    let generated = [
        "-i".to_owned(),
        conf.interface.clone(),
        "-l".to_owned(),
        "-n".to_owned(),
        "-s".to_owned(),
        conf.snap_len.to_string(),
        "-B".to_owned(),
        conf.buffer_size_mb.to_string(),
        "-f".to_owned(),
        filter.to_owned(),
        "-T".to_owned(),
        "fields".to_owned(),
        "-E".to_owned(),
        format!("separator={SEPARATOR}"),
        "-E".to_owned(),
        "occurrence=a".to_owned(),
    ];

    args.extend(generated);

    for field in FIELDS {
        args.push("-e".to_owned());
        args.push(field.to_owned());
    }

    args
}

fn helper_command(conf: &CaptureConf, filter: &str) -> Command {
    let mut command = Command::new(conf.helper_path.as_std_path());

    command
        .args(helper_args(conf, filter))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command
}

#[instrument(skip(helper), fields(pid = helper.id()))]
async fn terminate_helper(helper: &mut Child, grace: Duration) {
    match helper.try_wait() {
        Ok(Some(status)) => {
            debug!(%status, "Capture helper already exited");
            return;
        }
        Ok(None) => {}
        Err(error) => warn!(%error, "Failed to poll capture helper"),
    }

    if request_termination(helper) {
        match tokio::time::timeout(grace, helper.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Capture helper terminated");
                return;
            }
            Ok(Err(error)) => warn!(%error, "Failed to wait for capture helper"),
            Err(_) => warn!("Capture helper ignored SIGTERM, killing it"),
        }
    }

    if let Err(error) = helper.kill().await {
        warn!(%error, "Failed to kill capture helper");
    }
}

/// Sends SIGTERM; returns `false` when the helper must be killed right away.
#[cfg(unix)]
fn request_termination(helper: &Child) -> bool {
    let Some(pid) = helper.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };

    // SAFETY: `pid` is a child of this process that has not been reaped yet, so it cannot refer to another process.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };

    if ret != 0 {
        warn!(error = %io::Error::last_os_error(), "Failed to send SIGTERM to capture helper");
        return false;
    }

    true
}

#[cfg(not(unix))]
fn request_termination(_: &Child) -> bool {
    false
}

struct ReadLoopTask {
    stdout: ChildStdout,
    shared: Arc<Shared>,
    pipeline: Pipeline,
    rooms: ExpandedRooms,
    ptr: PtrSubmitter,
    event_log: Option<EventLogHandle>,
    utc_offset: UtcOffset,
}

#[async_trait]
impl Task for ReadLoopTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "capture read loop";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        let Self {
            stdout,
            shared,
            pipeline,
            rooms,
            ptr,
            event_log,
            utc_offset,
        } = self;

        let parser = LineParser {
            rooms: &rooms,
            dns: &pipeline.dns,
            ptr: Some(&ptr),
            threats: &pipeline.threats,
            classifier: &pipeline.classifier,
            utc_offset,
        };

        let mut stdout = BufReader::new(stdout);
        let mut buf = Vec::with_capacity(512);

        debug!("Task started");

        loop {
            buf.clear();

            let read = tokio::select! {
                read = stdout.read_until(b'\n', &mut buf) => read,
                _ = shutdown_signal.wait() => break,
            };

            match read {
                Ok(0) if shutdown_signal.is_signaled() => break,
                Ok(0) => {
                    shared.on_helper_exit("capture helper closed its output");
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    shared.on_helper_exit(&format!("failed to read capture helper output: {error}"));
                    break;
                }
            }

            // Payload fields (URIs, DNS names) are not guaranteed to be UTF-8.
            let line = String::from_utf8_lossy(trim_line_end(&buf));

            shared.lines_read.fetch_add(1, Ordering::Relaxed);

            let Some(event) = parser.parse(&line) else {
                shared.malformed_lines.fetch_add(1, Ordering::Relaxed);
                trace!(%line, "Skipped capture line");
                continue;
            };

            let event = Arc::new(event);

            if let Some(event_log) = &event_log {
                event_log.try_write(Arc::clone(&event));
            }

            shared.enqueue(event);
        }

        debug!("Task terminated");

        Ok(())
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

struct FlushLoopTask {
    shared: Arc<Shared>,
    delivery: Arc<Delivery>,
    batch_size: usize,
    flush_interval: Duration,
    dns_persist_interval: Duration,
}

#[async_trait]
impl Task for FlushLoopTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "capture flush loop";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        let pipeline = &self.delivery.pipeline;

        let mut tick = tokio::time::interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_flush = tokio::time::Instant::now();
        let mut last_dns_persist = tokio::time::Instant::now();

        debug!("Task started");

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown_signal.wait() => break,
            }

            let queued = self.shared.send_queue.lock().len();
            let due = queued >= self.batch_size || (queued > 0 && last_flush.elapsed() >= self.flush_interval);

            if due {
                self.shared.deliver_once(&self.delivery).await;
                last_flush = tokio::time::Instant::now();
            }

            if last_dns_persist.elapsed() >= self.dns_persist_interval {
                pipeline.persist_dns_cache().await;
                last_dns_persist = tokio::time::Instant::now();
            }

            if pipeline.asn.needs_persist() {
                if let Err(error) = pipeline.asn.save().await {
                    warn!(error = format!("{error:#}"), "Failed to persist ASN cache");
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

/// Forwards the helper diagnostics to the log, keeping the last line for status reporting.
struct HelperStderrTask {
    stderr: ChildStderr,
    shared: Arc<Shared>,
}

#[async_trait]
impl Task for HelperStderrTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "capture helper stderr";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        let mut stderr = BufReader::new(self.stderr);
        let mut buf = Vec::new();

        loop {
            buf.clear();

            let read = tokio::select! {
                read = stderr.read_until(b'\n', &mut buf) => read,
                _ = shutdown_signal.wait() => break,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();

                    if line.is_empty() {
                        continue;
                    }

                    debug!(line, "Capture helper");
                    *self.shared.helper_stderr_tail.lock() = Some(line.to_owned());
                }
                Err(error) => {
                    debug!(%error, "Failed to read capture helper stderr");
                    break;
                }
            }
        }

        Ok(())
    }
}
