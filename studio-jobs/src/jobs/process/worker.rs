//! Worker side of the process protocol.
//!
//! A worker binary calls [`serve`] from `main` with its task dispatcher. The
//! request is read from stdin, cancel requests are watched on a background
//! thread, and every report goes to stdout as a protocol line. Anything
//! else the task prints to stdout shows up as a job log line in the parent.

use std::io::{self, BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use super::protocol::{ParentMessage, WorkerMessage, encode_line};
use crate::jobs::cancel::CancelToken;
use crate::jobs::error::JobError;
use crate::jobs::progress::{ProgressReporter, ProgressSink};

/// Exit code after a `result` message.
pub const EXIT_OK: i32 = 0;
/// Exit code after an `error` message or a protocol failure.
pub const EXIT_FAILED: i32 = 1;
/// Exit code after a `cancelled` message.
pub const EXIT_CANCELLED: i32 = 2;

/// The request a worker was started for.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTask {
    pub job_id: String,
    pub name: String,
    pub task: String,
    pub params: Value,
}

/// Writes protocol messages to stdout, one line at a time.
struct StdoutSink;

impl StdoutSink {
    fn emit(&self, message: &WorkerMessage) {
        let line = match encode_line(message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode worker message: {}", e);
                return;
            }
        };
        let mut handle = io::stdout().lock();
        if let Err(e) = handle
            .write_all(line.as_bytes())
            .and_then(|_| handle.flush())
        {
            // The parent is gone; nothing left to report to.
            debug!("Failed to write to parent: {}", e);
        }
    }
}

impl ProgressSink for StdoutSink {
    fn progress(&self, fraction: f64, message: Option<&str>) {
        self.emit(&WorkerMessage::Progress {
            progress: fraction,
            message: message.map(str::to_string),
        });
    }

    fn log_line(&self, line: &str) {
        self.emit(&WorkerMessage::Log {
            line: line.to_string(),
        });
    }
}

fn read_request(input: &mut impl BufRead) -> Result<WorkerTask, String> {
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .map_err(|e| format!("failed to read request: {}", e))?;
    if read == 0 {
        return Err("stdin closed before a request arrived".to_string());
    }
    match serde_json::from_str::<ParentMessage>(line.trim()) {
        Ok(ParentMessage::Run {
            job_id,
            name,
            task,
            params,
        }) => Ok(WorkerTask {
            job_id,
            name,
            task,
            params,
        }),
        Ok(ParentMessage::Cancel) => Err("cancelled before the request arrived".to_string()),
        Err(e) => Err(format!("malformed request: {}", e)),
    }
}

/// Cancel `token` on a cancel message or when the parent closes stdin.
fn watch_for_cancel(mut input: impl BufRead + Send + 'static, token: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("cancel-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                match input.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        debug!("Parent closed stdin, cancelling");
                        token.cancel();
                        return;
                    }
                    Ok(_) => {
                        if let Ok(ParentMessage::Cancel) = serde_json::from_str(line.trim()) {
                            debug!("Cancel requested by parent");
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start cancel watcher: {}", e);
    }
}

/// Run one task from stdin and report its outcome on stdout.
///
/// Returns the process exit code; pass it to [`std::process::exit`].
pub fn serve<H>(handler: H) -> i32
where
    H: FnOnce(&WorkerTask, &CancelToken, &ProgressReporter) -> Result<Value, JobError>,
{
    let sink = Arc::new(StdoutSink);
    let mut stdin = io::BufReader::new(io::stdin());

    let task = match read_request(&mut stdin) {
        Ok(task) => task,
        Err(message) => {
            error!("{}", message);
            sink.emit(&WorkerMessage::Error { message });
            return EXIT_FAILED;
        }
    };
    debug!("Worker running task {} for job {}", task.task, task.job_id);

    let token = CancelToken::new();
    watch_for_cancel(stdin, token.clone());
    let reporter = ProgressReporter::new(sink.clone());

    let outcome = catch_unwind(AssertUnwindSafe(|| handler(&task, &token, &reporter)))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(JobError::failed(format!("task panicked: {}", message)))
        });
    reporter.flush();

    match outcome {
        Ok(value) => {
            sink.emit(&WorkerMessage::Result { value });
            EXIT_OK
        }
        Err(JobError::Cancelled) => {
            sink.emit(&WorkerMessage::Cancelled);
            EXIT_CANCELLED
        }
        Err(e) => {
            sink.emit(&WorkerMessage::Error {
                message: e.to_string(),
            });
            EXIT_FAILED
        }
    }
}
