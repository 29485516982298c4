//! Progress and log reporting for job bodies.
//!
//! A job body receives a [`ProgressReporter`]; where the reports end up is
//! decided by the [`ProgressSink`] behind it (the event bus for in-process
//! jobs, the worker protocol on stdout for out-of-process jobs).

use std::io;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, JobEvent, JobEventPayload};

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex is valid")
});
static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B-\x1F\x7F-\x{9F}]").expect("static regex is valid")
});

/// Clamp a reported fraction into `[0, 1]`.
///
/// Negative values are the "aborted" convention and record as `0.0`; NaN is
/// treated the same way.
pub fn clamp_progress(fraction: f64) -> f64 {
    if fraction.is_nan() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0)
}

/// Strip ANSI escape sequences and control characters from a log line.
pub fn clean_log_line(line: &str) -> String {
    let without_ansi = ANSI_ESCAPE.replace_all(line, "");
    CONTROL_CHARS.replace_all(&without_ansi, "").trim().to_string()
}

/// Destination of progress and log reports.
pub trait ProgressSink: Send + Sync {
    /// `fraction` is already clamped.
    fn progress(&self, fraction: f64, message: Option<&str>);
    /// `line` is already cleaned and non-empty.
    fn log_line(&self, line: &str);
    fn flush(&self) {}
}

struct NoopSink;

impl ProgressSink for NoopSink {
    fn progress(&self, _fraction: f64, _message: Option<&str>) {}
    fn log_line(&self, _line: &str) {}
}

/// Handle a job body uses to report progress and output.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Report progress with a status line. An empty message reports none.
    pub fn report(&self, fraction: f64, message: impl AsRef<str>) {
        let message = message.as_ref();
        let message = (!message.is_empty()).then_some(message);
        self.sink.progress(clamp_progress(fraction), message);
    }

    /// Report progress without changing the status line.
    pub fn set_fraction(&self, fraction: f64) {
        self.sink.progress(clamp_progress(fraction), None);
    }

    /// Append output. Multi-line input is split; blank lines are dropped.
    pub fn log(&self, text: &str) {
        for raw in text.lines() {
            let line = clean_log_line(raw);
            if !line.is_empty() {
                self.sink.log_line(&line);
            }
        }
    }

    /// An [`io::Write`] adapter that turns written bytes into log lines.
    ///
    /// Hand it to code that expects a console stream instead of redirecting
    /// the process-wide stdout.
    pub fn log_writer(&self) -> JobLogWriter {
        JobLogWriter {
            reporter: self.clone(),
            buf: Vec::new(),
        }
    }

    /// Deliver anything the sink is still holding back.
    pub fn flush(&self) {
        self.sink.flush();
    }
}

/// Line-splitting writer created by [`ProgressReporter::log_writer`].
///
/// Partial lines are held until a newline arrives, `flush` is called, or
/// the writer is dropped.
pub struct JobLogWriter {
    reporter: ProgressReporter,
    buf: Vec<u8>,
}

impl JobLogWriter {
    fn emit_complete_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.reporter.log(&String::from_utf8_lossy(&line));
        }
    }

    fn emit_remainder(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.reporter.log(&String::from_utf8_lossy(&rest));
        }
    }
}

impl io::Write for JobLogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.emit_complete_lines();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_remainder();
        self.reporter.flush();
        Ok(())
    }
}

impl Drop for JobLogWriter {
    fn drop(&mut self) {
        self.emit_remainder();
    }
}

/// Batching limits for log events published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatchConfig {
    /// Minimum spacing between unforced log events, in milliseconds.
    pub interval_ms: u64,
    /// Maximum number of lines joined into one event.
    pub max_lines: usize,
}

impl Default for LogBatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 150,
            max_lines: 40,
        }
    }
}

#[derive(Default)]
struct LogBatch {
    pending: Vec<String>,
    last_flush: Option<Instant>,
}

/// Sink publishing job progress and batched log lines on the event bus.
pub(crate) struct EventBusSink {
    bus: Arc<EventBus>,
    job_id: String,
    name: String,
    config: LogBatchConfig,
    batch: Mutex<LogBatch>,
}

impl EventBusSink {
    pub(crate) fn new(
        bus: Arc<EventBus>,
        job_id: impl Into<String>,
        name: impl Into<String>,
        config: LogBatchConfig,
    ) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            name: name.into(),
            config,
            batch: Mutex::new(LogBatch::default()),
        }
    }

    fn drain(&self, force: bool) {
        let chunks = {
            let mut batch = self.batch.lock();
            if batch.pending.is_empty() {
                return;
            }
            let interval = Duration::from_millis(self.config.interval_ms);
            let due = batch.last_flush.is_none_or(|t| t.elapsed() >= interval);
            if !force && !due {
                return;
            }
            batch.last_flush = Some(Instant::now());
            let max_lines = self.config.max_lines.max(1);
            let pending = std::mem::take(&mut batch.pending);
            pending
                .chunks(max_lines)
                .map(|chunk| chunk.join("\n"))
                .collect::<Vec<_>>()
        };

        for line in chunks {
            self.bus.publish(&JobEvent::new(
                &self.job_id,
                &self.name,
                JobEventPayload::LogLine { line },
            ));
        }
    }
}

impl ProgressSink for EventBusSink {
    fn progress(&self, fraction: f64, message: Option<&str>) {
        self.bus.publish(&JobEvent::new(
            &self.job_id,
            &self.name,
            JobEventPayload::Progress {
                progress: fraction,
                message: message.map(str::to_string),
            },
        ));
    }

    fn log_line(&self, line: &str) {
        self.batch.lock().pending.push(line.to_string());
        self.drain(false);
    }

    fn flush(&self) {
        self.drain(true);
    }
}
