//! Per-step log files.
//!
//! A [`StepLog`] installs a thread-scoped subscriber that writes every event
//! both to the step's log file (truncated on open) and to stderr, using the
//! `[timestamp] LEVEL - message` line layout. Dropping it restores the
//! previous subscriber and syncs the file.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber, error};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::artifact::ensure_parent_dir;
use crate::error::{PipelineError, StepResult};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Event formatter producing `[2024-05-01 12:00:00,123] INFO - message`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLineFormat;

impl<S, N> FormatEvent<S, N> for LogLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] {} - ",
            Local::now().format(TIMESTAMP_FORMAT),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

pub struct StepLog {
    file: Arc<File>,
    _guard: DefaultGuard,
}

impl StepLog {
    pub fn open(path: &Path, level: LevelFilter) -> StepResult<Self> {
        ensure_parent_dir(path)?;
        let file = Arc::new(File::create(path).map_err(|err| PipelineError::io(path, err))?);

        let subscriber = tracing_subscriber::registry()
            .with(level)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(LogLineFormat)
                    .with_ansi(false)
                    .with_writer(file.clone()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(LogLineFormat)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            );
        let guard = tracing::subscriber::set_default(subscriber);

        Ok(Self {
            file,
            _guard: guard,
        })
    }
}

impl Drop for StepLog {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
    }
}

/// Run `body` with its events routed to `log_path`. A returned error is
/// written to the log before it propagates.
pub fn with_step_log<T>(
    log_path: &Path,
    level: LevelFilter,
    body: impl FnOnce() -> StepResult<T>,
) -> StepResult<T> {
    let _log = StepLog::open(log_path, level)?;
    body().inspect_err(|err| error!("{err}"))
}
