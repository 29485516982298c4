//! Process-mode jobs: a runner that launches worker processes and the
//! worker-side protocol loop.

mod command;
pub mod protocol;
mod runner;
pub mod worker;

pub use command::WorkerCommand;
pub use protocol::{ParentMessage, WorkerMessage, WorkerRequest};
pub use runner::{ProcessJobRunner, ProcessRunnerConfig};
pub use worker::{WorkerTask, serve};
