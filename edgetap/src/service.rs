use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use edgetap::capture::CaptureManager;
use edgetap::config::ConfHandle;
use edgetap::delivery::{BatchSink, HttpBatchSink};
use edgetap::log::{self, LoggerGuard};
use edgetap::pipeline::{Backends, Pipeline};
use edgetap::threat::{HttpFeedFetcher, ThreatRefreshTask};
use edgetap_task::{TaskOutcome, TaskSet};
use tokio::runtime::{self, Runtime};

const BACKGROUND_TASKS_GRACE: Duration = Duration::from_secs(5);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum ServiceState {
    Stopped,
    Running {
        runtime: Runtime,
        manager: Arc<CaptureManager>,
        background: TaskSet<anyhow::Result<()>>,
    },
}

pub struct EdgetapService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl EdgetapService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = log::init(
            &conf.log_file,
            conf.verbosity_profile.to_log_filter(),
            conf.debug.log_directives.as_deref(),
        )
        .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        let conf_file = conf_handle.get_conf_file();
        trace!(?conf_file);

        if !conf.debug.is_default() {
            warn!(
                ?conf.debug,
                "**DEBUG OPTIONS ARE ENABLED, PLEASE DO NOT USE IN PRODUCTION**",
            );
        }

        Ok(EdgetapService {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf = self.conf_handle.get_conf();

        let (manager, background) = runtime.block_on(async {
            let pipeline = Pipeline::new(&conf, Backends::system(&conf), true);
            pipeline.load().await;

            let mut background: TaskSet<anyhow::Result<()>> = TaskSet::new();

            if conf.threat.enabled {
                let fetcher = HttpFeedFetcher::new(Duration::from_secs(conf.threat.fetch_timeout_secs))?;

                background.register(ThreatRefreshTask {
                    threats: Arc::clone(&pipeline.threats),
                    fetcher: Arc::new(fetcher),
                    check_interval: Duration::from_secs(conf.threat.refresh_check_secs),
                });
            }

            let sink: Option<Arc<dyn BatchSink>> = match &conf.delivery.endpoint {
                Some(endpoint) => Some(Arc::new(HttpBatchSink::new(endpoint.clone(), &conf.delivery)?)),
                None => {
                    warn!("No delivery endpoint configured, events are counted and discarded");
                    None
                }
            };

            let manager = Arc::new(CaptureManager::new(Arc::clone(&conf), pipeline, sink));

            // Not fatal: the service keeps running and reports the error in its status.
            if let Err(error) = manager.start().await {
                let error = anyhow::Error::new(error);
                warn!(error = format!("{error:#}"), "Capture not started");
            }

            anyhow::Ok((manager, background))
        })?;

        self.state = ServiceState::Running {
            runtime,
            manager,
            background,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop edgetap service, but it's already stopped");
            }
            ServiceState::Running {
                runtime,
                manager,
                background,
            } => {
                info!("Stopping edgetap service");

                runtime.block_on(async {
                    manager.flush_remaining().await;
                    manager.stop().await;

                    for outcome in background.shutdown(BACKGROUND_TASKS_GRACE).await {
                        if !matches!(outcome, TaskOutcome::Finished { output: Ok(()), .. }) {
                            warn!(task = outcome.name(), "Background task did not terminate cleanly");
                        }
                    }
                });

                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            }
        }
    }
}
