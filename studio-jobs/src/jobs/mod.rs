//! Background job execution.
//!
//! - [`JobRunner`] runs blocking closures on the tokio blocking pool.
//! - [`ProcessJobRunner`] runs tasks in separate worker processes.
//! - [`JobRegistry`] folds the resulting events into UI-readable records
//!   and optionally persists them through a [`JobEventStore`].

mod cancel;
mod error;
mod handle;
pub mod policy;
pub mod process;
pub mod progress;
pub mod registry;
mod runner;
pub mod store;
mod supervisor;

pub use cancel::CancelToken;
pub use error::JobError;
pub use handle::JobHandle;
pub use policy::JobPolicy;
pub use process::{ProcessJobRunner, ProcessRunnerConfig, WorkerCommand, WorkerRequest};
pub use progress::{JobLogWriter, LogBatchConfig, ProgressReporter, ProgressSink, clamp_progress};
pub use registry::{JobAction, JobRecord, JobRegistry, JobRegistryConfig, JobStatus};
pub use runner::{JobRunner, JobRunnerConfig};
pub use store::{JobEventStore, JsonlJobEventStore, JsonlStoreConfig};
