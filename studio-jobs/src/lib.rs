//! Background job core of the detection training studio.
//!
//! Long-running operations (training, export, validation, sliced inference,
//! deployment) are submitted to a [`JobRunner`] or [`ProcessJobRunner`],
//! which enforce the [`JobPolicy`] and publish lifecycle events on an
//! [`EventBus`]. A [`JobRegistry`] folds those events into the records the
//! jobs view renders, persisting them through a [`JsonlJobEventStore`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use studio_jobs::{EventBus, JobPolicy, JobRegistry, JobRegistryConfig, JobRunner, JobRunnerConfig};
//!
//! # async fn demo() -> Result<(), studio_jobs::JobError> {
//! let bus = Arc::new(EventBus::new());
//! let registry = JobRegistry::new(bus.clone(), JobRegistryConfig::default(), None);
//! let runner = JobRunner::new(bus, JobRunnerConfig::default());
//!
//! let handle = runner.submit(
//!     "export_onnx",
//!     |token, progress| {
//!         for step in 0..10 {
//!             token.check()?;
//!             progress.report(step as f64 / 10.0, format!("layer {}", step));
//!         }
//!         Ok("model.onnx")
//!     },
//!     JobPolicy::default(),
//! );
//! let job_id = handle.job_id().to_string();
//! handle.join().await?;
//! assert!(registry.get(&job_id).is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod observability;

pub use config::{JobsPolicyConfig, PolicyFloor, StudioPaths};
pub use error::{Error, Result};
pub use events::{EventBus, JobEvent, JobEventHandler, JobEventKind, JobEventPayload};
pub use jobs::{
    CancelToken, JobError, JobHandle, JobPolicy, JobRecord, JobRegistry, JobRegistryConfig,
    JobRunner, JobRunnerConfig, JobStatus, JsonlJobEventStore, ProcessJobRunner,
    ProcessRunnerConfig, ProgressReporter, WorkerCommand, WorkerRequest,
};
