use crate::transaction::TransactionId;
use crate::utils::file_utils::ensure_dir;
use anyhow::Result;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;

#[derive(Debug, serde::Deserialize, Default, Clone)]
/// Where the agent writes its logs and how much detail goes there
pub struct LoggingConfig {
    /// Minimum level, in [EnvFilter] directive syntax
    pub level: String,
    /// Directory for the JSON log file, empty to skip the file entirely
    pub directory: String,
    /// Also print a compact log to stdout
    #[serde(default)]
    pub stdout: Option<bool>,
    /// Log file name, without the `.log` extension
    pub basename: String,
    /// Span events to record, e.g. `NEW+CLOSE`.
    /// One or more of `NEW`, `ENTER`, `EXIT`, `CLOSE`, `NONE`, `ACTIVE`, `FULL` joined by `+`
    pub spanning: String,
    /// Attach the entered span list to JSON lines
    #[serde(default)]
    pub include_spans_json: bool,
}

impl LoggingConfig {
    /// Prepare the file log target, removing the previous run's file.
    /// `None` when file logging is off.
    fn fresh_log_file(&self) -> Result<Option<(PathBuf, String)>> {
        if self.directory.is_empty() {
            return Ok(None);
        }
        ensure_dir(&self.directory)?;
        let dir = match std::fs::canonicalize(&self.directory) {
            Ok(d) => d,
            Err(e) => anyhow::bail!("Log directory '{}' is unusable: {}", self.directory, e),
        };
        let file_name = format!("{}.log", self.basename);
        let previous = dir.join(&file_name);
        if previous.exists() {
            if let Err(e) = std::fs::remove_file(&previous) {
                anyhow::bail!("Could not clear old log '{}': {}", previous.display(), e);
            }
        }
        Ok(Some((dir, file_name)))
    }
}

fn span_events(spanning: &str) -> Result<FmtSpan> {
    spanning.split('+').try_fold(FmtSpan::NONE, |events, part| {
        let event = match part {
            "" | "NONE" => FmtSpan::NONE,
            "NEW" => FmtSpan::NEW,
            "ENTER" => FmtSpan::ENTER,
            "EXIT" => FmtSpan::EXIT,
            "CLOSE" => FmtSpan::CLOSE,
            "ACTIVE" => FmtSpan::ACTIVE,
            "FULL" => FmtSpan::FULL,
            other => anyhow::bail!("Unknown span event '{}' in '{}'", other, spanning),
        };
        Ok(events | event)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Panics go to the `panic` target so they land in the JSON log with everything else
fn log_panics() {
    std::panic::set_hook(Box::new(|info| {
        let thread = std::thread::current();
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            target: "panic",
            thread = thread.name().unwrap_or("<unnamed>"),
            location = %location,
            backtrace = %std::backtrace::Backtrace::force_capture(),
            "Panic: {}",
            panic_message(info.payload())
        );
    }));
}

/// Keeps the background log writers alive, pending lines are flushed when this drops
#[must_use = "logs are lost once the guard is dropped"]
pub struct TracingGuard {
    _writers: Vec<WorkerGuard>,
}

/// Install the global tracing subscriber described by `config`.
/// Hold onto the returned guard until the process exits.
pub fn start_tracing(config: &Arc<LoggingConfig>, tid: &TransactionId) -> Result<TracingGuard> {
    let mut writers = vec![];

    let file_layer = match config.fresh_log_file()? {
        Some((dir, file_name)) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            writers.push(guard);
            Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_span_events(span_events(&config.spanning)?)
                    .with_writer(writer)
                    .json()
                    .with_span_list(config.include_spans_json),
            )
        },
        None => None,
    };
    let stdout_layer = match config.stdout {
        Some(true) => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            writers.push(guard);
            Some(tracing_subscriber::fmt::Layer::default().with_writer(writer).compact())
        },
        _ => None,
    };

    let subscriber = Registry::default()
        .with(EnvFilter::builder().parse(&config.level)?)
        .with(file_layer)
        .with(stdout_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        warn!(tid=tid, error=%e, "Tracing was already installed, keeping the existing subscriber");
        return Ok(TracingGuard { _writers: vec![] });
    }
    log_panics();
    info!(tid=tid, level=%config.level, file=!config.directory.is_empty(), "Logging started");
    Ok(TracingGuard { _writers: writers })
}
