//! Logging, panic reporting and support bundles.

pub mod crash_bundle;
pub mod logging;
pub mod panic_hook;

pub use crash_bundle::{CrashBundleOptions, create_crash_bundle};
pub use logging::{LogEvent, LoggingHandle, init_logging, init_worker_logging};
