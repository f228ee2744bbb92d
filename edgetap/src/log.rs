use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_LOG_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "edgetap";

/// Keeps the non-blocking writers alive; logs emitted after drop are lost.
pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

/// Splits the configured log path into a directory and a file name prefix.
fn split_log_path(path: &Utf8Path) -> anyhow::Result<(&Utf8Path, &str)> {
    if path.is_dir() {
        Ok((path, LOG_FILE_PREFIX))
    } else {
        let folder = path.parent().context("invalid log path (parent)")?;
        let prefix = path.file_name().context("invalid log path (file_name)")?;
        Ok((folder, prefix))
    }
}

/// Builds the filter from the profile directives plus optional comma-separated debug directives.
pub fn build_env_filter(log_filter: &str, debug_filtering_directives: Option<&str>) -> anyhow::Result<EnvFilter> {
    let mut env_filter =
        EnvFilter::try_new(log_filter).context("invalid built-in filtering directives (this is a bug)")?;

    for directive in debug_filtering_directives
        .into_iter()
        .flat_map(|directives| directives.split(','))
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        let directive = directive
            .parse()
            .with_context(|| format!("invalid log directive: {directive}"))?;
        env_filter = env_filter.add_directive(directive);
    }

    Ok(env_filter)
}

pub fn init(
    path: &Utf8Path,
    log_filter: &str,
    debug_filtering_directives: Option<&str>,
) -> anyhow::Result<LoggerGuard> {
    let (folder, prefix) = split_log_path(path)?;

    std::fs::create_dir_all(folder).with_context(|| format!("failed to create log directory {folder}"))?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(folder)
        .context("couldn’t create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = build_env_filter(log_filter, debug_filtering_directives)?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .try_init()
        .context("a global subscriber is already installed")?;

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
