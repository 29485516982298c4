//! Worker process for process-mode jobs.
//!
//! Reads one request from stdin, runs the named task and reports on stdout
//! using the worker protocol. Logs go to stderr, which the parent turns into
//! job log lines.

use std::time::Duration;

use serde_json::{Value, json};
use studio_jobs::jobs::process::{WorkerTask, serve};
use studio_jobs::observability::init_worker_logging;
use studio_jobs::{CancelToken, JobError, ProgressReporter};
use tracing::{info, warn};

fn param_u64(params: &Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// `steps` x `step_ms` of simulated work, reporting progress each step.
fn sleep_task(params: &Value, token: &CancelToken, progress: &ProgressReporter) -> Result<Value, JobError> {
    let steps = param_u64(params, "steps", 10).max(1);
    let step = Duration::from_millis(param_u64(params, "step_ms", 100));

    for i in 1..=steps {
        token.check()?;
        std::thread::sleep(step);
        progress.report(i as f64 / steps as f64, format!("step {}/{}", i, steps));
    }
    progress.log(&format!("completed {} steps", steps));
    Ok(json!({ "steps": steps }))
}

fn run(task: &WorkerTask, token: &CancelToken, progress: &ProgressReporter) -> Result<Value, JobError> {
    info!(task = %task.task, job_id = %task.job_id, "Worker task started");
    match task.task.as_str() {
        "sleep" => sleep_task(&task.params, token, progress),
        "echo" => {
            progress.log(&task.params.to_string());
            Ok(task.params.clone())
        }
        "fail" => {
            let message = task
                .params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("task failed");
            Err(JobError::failed(message))
        }
        other => Err(JobError::failed(format!("unknown task: {}", other))),
    }
}

fn main() {
    if let Err(e) = init_worker_logging() {
        eprintln!("failed to initialize logging: {}", e);
    }
    let code = serve(run);
    if code != 0 {
        warn!(code, "Worker exiting with failure");
    }
    std::process::exit(code);
}
