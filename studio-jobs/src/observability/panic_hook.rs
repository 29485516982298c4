//! Panic reporting.
//!
//! Job bodies that panic are caught and turned into job failures, but the
//! panic itself is still worth keeping: the hook logs it through `tracing`
//! and appends a record to `panic.log` so crash bundles carry it even when
//! the buffered log writer never got to flush.

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Local;

/// File inside the log directory receiving panic records.
pub const PANIC_LOG_FILE: &str = "panic.log";

/// Install the global panic hook. The previously installed hook still runs.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = format_panic_record(panic_info);
            tracing::error!(target: "studio_jobs::panic", "{record}");
            if let Err(e) = append_panic_record(&log_dir, &record) {
                tracing::warn!("Failed to write panic record: {}", e);
            }
        }));

        previous_hook(panic_info);
    }));
}

fn append_panic_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let path = PathBuf::from(log_dir).join(PANIC_LOG_FILE);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
    let payload = payload_message(panic_info);

    // Honours RUST_BACKTRACE.
    let backtrace = Backtrace::capture();

    format!(
        "{ts} PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{backtrace}"
    )
}

fn payload_message(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        panic_info.to_string()
    }
}
