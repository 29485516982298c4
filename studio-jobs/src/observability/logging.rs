//! Application logging.
//!
//! - Console and daily-rolling file output (`logs/app.log.YYYY-MM-DD`) with
//!   local-time timestamps
//! - A filter that can be changed at runtime
//! - A broadcast stream of log records for the in-app log viewer
//! - Removal of log files past the retention period

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Event, Subscriber, debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

use crate::error::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "studio_jobs=info,frame_buffers=info";

/// Prefix of the rolling log files inside the log directory.
pub const LOG_FILE_PREFIX: &str = "app.log";

const LOG_RETENTION_DAYS: i64 = 7;
const LOG_BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// One log record as delivered to log viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Runtime control over the installed logger.
pub struct LoggingHandle {
    filter: FilterHandle,
    log_tx: broadcast::Sender<LogEvent>,
    log_dir: PathBuf,
}

impl LoggingHandle {
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `"studio_jobs=debug"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid log filter {:?}: {}", directive, e)))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("failed to reload log filter: {}", e)))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Stream of log records emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Remove expired log files now and then once a day until `cancel`.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(24 * 60 * 60);
            loop {
                let today = Local::now().date_naive();
                if let Err(e) = cleanup_old_logs(&log_dir, today, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to clean up old logs");
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Log retention cleanup stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

/// Delete `app.log.YYYY-MM-DD` files dated more than `retention_days` before
/// `today`. Returns how many were deleted.
pub async fn cleanup_old_logs(
    log_dir: &Path,
    today: NaiveDate,
    retention_days: i64,
) -> std::io::Result<usize> {
    let cutoff = today - chrono::Duration::days(retention_days);
    let prefix = format!("{}.", LOG_FILE_PREFIX);
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix.as_str()))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date >= cutoff || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

struct BroadcastLayer {
    tx: broadcast::Sender<LogEvent>,
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let metadata = event.metadata();
        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));

        let _ = self.tx.send(LogEvent {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
        });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        } else if self.0.is_empty() {
            *self.0 = format!("{}: {:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.0.is_empty() {
            *self.0 = value.to_string();
        }
    }
}

/// Install the global subscriber for the studio application.
///
/// Keep the returned guard alive for the lifetime of the process; dropping
/// it stops the background file writer.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingHandle>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| Error::io_path("creating log directory", log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let initial =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter) = reload::Layer::new(initial);

    let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(BroadcastLayer { tx: log_tx.clone() })
        .try_init()
        .map_err(|e| Error::Other(format!("failed to install log subscriber: {}", e)))?;

    let handle = Arc::new(LoggingHandle {
        filter,
        log_tx,
        log_dir: log_dir.to_path_buf(),
    });
    info!(log_dir = %log_dir.display(), "Logging initialized");
    Ok((handle, guard))
}

/// Install a stderr-only subscriber for worker processes, whose stdout is
/// reserved for protocol messages.
pub fn init_worker_logging() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("failed to install log subscriber: {}", e)))
}
