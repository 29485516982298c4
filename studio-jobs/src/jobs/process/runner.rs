//! Out-of-process job runner.
//!
//! Every attempt launches a fresh worker process, hands it a
//! [`WorkerRequest`] over stdin and follows its progress on stdout. Unlike
//! in-process jobs, a worker can be terminated: it is killed when it ignores
//! a cancel request for too long or when the attempt times out.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::WorkerCommand;
use super::protocol::{ParentMessage, WorkerMessage, WorkerRequest, encode_line};
use crate::jobs::cancel::CancelToken;
use crate::jobs::error::JobError;
use crate::jobs::handle::JobHandle;
use crate::jobs::policy::JobPolicy;
use crate::jobs::progress::{EventBusSink, LogBatchConfig, ProgressReporter};
use crate::jobs::supervisor::{InFlight, JobContext, supervise};
use crate::events::EventBus;

/// Configuration for [`ProcessJobRunner`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRunnerConfig {
    /// Maximum number of worker processes alive at once.
    pub max_workers: usize,
    /// How long a worker may keep running after a cancel request.
    pub cancel_grace_ms: u64,
    /// How long to wait for a worker to exit after its final message.
    pub exit_drain_ms: u64,
    pub log_batch: LogBatchConfig,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            cancel_grace_ms: 3000,
            exit_drain_ms: 300,
            log_batch: LogBatchConfig::default(),
        }
    }
}

/// Runs jobs in worker processes speaking the JSON-lines protocol.
pub struct ProcessJobRunner {
    bus: Arc<EventBus>,
    config: ProcessRunnerConfig,
    permits: Arc<Semaphore>,
    runtime: Handle,
    in_flight: Arc<InFlight>,
}

impl ProcessJobRunner {
    /// Create a runner bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(bus: Arc<EventBus>, config: ProcessRunnerConfig) -> Self {
        Self::with_runtime(bus, config, Handle::current())
    }

    pub fn with_runtime(bus: Arc<EventBus>, config: ProcessRunnerConfig, runtime: Handle) -> Self {
        let workers = config.max_workers.max(1);
        info!("Starting process job runner with {} workers", workers);
        Self {
            bus,
            permits: Arc::new(Semaphore::new(workers)),
            config,
            runtime,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn config(&self) -> &ProcessRunnerConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Submit a job executed by `command`.
    ///
    /// The job's result is the `value` of the worker's `result` message.
    pub fn submit(
        &self,
        name: &str,
        command: WorkerCommand,
        request: WorkerRequest,
        policy: JobPolicy,
    ) -> JobHandle<Value> {
        self.submit_with_token(name, CancelToken::new(), command, request, policy)
    }

    /// Like [`submit`](Self::submit) with a caller-owned cancel token.
    pub fn submit_with_token(
        &self,
        name: &str,
        token: CancelToken,
        command: WorkerCommand,
        request: WorkerRequest,
        policy: JobPolicy,
    ) -> JobHandle<Value> {
        let ctx = JobContext::new(self.bus.clone(), name, token);
        ctx.announce();
        self.in_flight.insert(&ctx.job_id, &ctx.token);

        let (tx, rx) = oneshot::channel();
        let handle = JobHandle::new(ctx.job_id.clone(), ctx.name.clone(), ctx.token.clone(), rx);

        let reporter = ProgressReporter::new(Arc::new(EventBusSink::new(
            self.bus.clone(),
            &ctx.job_id,
            &ctx.name,
            self.config.log_batch.clone(),
        )));
        let attempt = Arc::new(WorkerAttempt {
            job_id: ctx.job_id.clone(),
            name: ctx.name.clone(),
            command,
            request,
            token: ctx.token.clone(),
            reporter: reporter.clone(),
            cancel_grace: Duration::from_millis(self.config.cancel_grace_ms),
            exit_drain: Duration::from_millis(self.config.exit_drain_ms),
        });
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();

        self.runtime.spawn(async move {
            let outcome = supervise(&ctx, &policy, |number| {
                let attempt = attempt.clone();
                let permits = permits.clone();
                async move {
                    let _permit = tokio::select! {
                        permit = permits.acquire_owned() => {
                            permit.map_err(|_| JobError::failed("process runner is closed"))?
                        }
                        _ = attempt.token.cancelled() => return Err(JobError::Cancelled),
                    };
                    attempt.token.check()?;
                    let result = attempt.run(number).await;
                    attempt.reporter.flush();
                    result
                }
            })
            .await;

            reporter.flush();
            in_flight.remove(&ctx.job_id);
            if tx.send(outcome).is_err() {
                debug!("Job {} handle dropped before completion", ctx.job_id);
            }
        });

        handle
    }

    /// Cancel every in-flight job; workers get their grace period.
    pub fn shutdown(&self) {
        let count = self.in_flight.cancel_all();
        info!("Process job runner shutting down, cancelled {} job(s)", count);
    }
}

/// Everything needed to run one attempt of a process job.
struct WorkerAttempt {
    job_id: String,
    name: String,
    command: WorkerCommand,
    request: WorkerRequest,
    token: CancelToken,
    reporter: ProgressReporter,
    cancel_grace: Duration,
    exit_drain: Duration,
}

impl WorkerAttempt {
    async fn run(&self, number: u32) -> Result<Value, JobError> {
        let program = self.command.program.display().to_string();
        let mut child = self.command.to_tokio_command().spawn().map_err(|e| {
            JobError::failed(format!("failed to spawn worker {}: {}", program, e))
        })?;
        debug!(
            "Job {} attempt {} running in worker pid {:?}",
            self.job_id,
            number,
            child.id()
        );

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobError::failed("worker stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::failed("worker stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::failed("worker stderr is not piped"))?;

        let run = ParentMessage::Run {
            job_id: self.job_id.clone(),
            name: self.name.clone(),
            task: self.request.task.clone(),
            params: self.request.params.clone(),
        };
        send(&mut stdin, &run)
            .await
            .map_err(|e| JobError::failed(format!("failed to send request to worker: {}", e)))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut kill_at: Option<Instant> = None;
        let mut outcome: Option<Result<Value, JobError>> = None;

        while outcome.is_none() && (stdout_open || stderr_open) {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => outcome = self.on_stdout_line(&line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Failed to read worker stdout for job {}: {}", self.job_id, e);
                        stdout_open = false;
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => self.reporter.log(&line),
                    Ok(None) | Err(_) => stderr_open = false,
                },
                _ = self.token.cancelled(), if kill_at.is_none() => {
                    debug!("Sending cancel to worker for job {}", self.job_id);
                    if let Err(e) = send(&mut stdin, &ParentMessage::Cancel).await {
                        debug!("Worker for job {} did not take the cancel request: {}", self.job_id, e);
                    }
                    kill_at = Some(Instant::now() + self.cancel_grace);
                },
                _ = sleep_until_or_never(kill_at) => {
                    warn!(
                        "Worker for job {} ignored cancellation for {:?}, killing it",
                        self.job_id, self.cancel_grace
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill worker for job {}: {}", self.job_id, e);
                    }
                    outcome = Some(Err(JobError::Cancelled));
                },
            }
        }

        drop(stdin);
        match tokio::time::timeout(self.exit_drain, child.wait()).await {
            Ok(Ok(status)) => {
                if outcome.is_none() {
                    outcome = Some(Err(if self.token.is_cancelled() {
                        JobError::Cancelled
                    } else {
                        match status.code() {
                            Some(code) => JobError::failed(format!(
                                "worker exited with code {} without a result payload",
                                code
                            )),
                            None => JobError::failed("worker exited without a result payload"),
                        }
                    }));
                }
            }
            Ok(Err(e)) => warn!("Failed to wait for worker of job {}: {}", self.job_id, e),
            Err(_) => {
                debug!("Worker for job {} still running after its final message, killing it", self.job_id);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker for job {}: {}", self.job_id, e);
                }
            }
        }

        outcome.unwrap_or_else(|| Err(JobError::failed("worker exited without a result payload")))
    }

    /// Apply one stdout line; returns the attempt outcome for terminal
    /// messages.
    fn on_stdout_line(&self, line: &str) -> Option<Result<Value, JobError>> {
        match WorkerMessage::parse(line) {
            Some(WorkerMessage::Progress { progress, message }) => {
                match message {
                    Some(message) => self.reporter.report(progress, message),
                    None => self.reporter.set_fraction(progress),
                }
                None
            }
            Some(WorkerMessage::Log { line }) => {
                self.reporter.log(&line);
                None
            }
            Some(WorkerMessage::Result { value }) => Some(Ok(value)),
            Some(WorkerMessage::Error { message }) => Some(Err(JobError::Failed(message))),
            Some(WorkerMessage::Cancelled) => Some(Err(JobError::Cancelled)),
            None => {
                self.reporter.log(line);
                None
            }
        }
    }
}

async fn send(stdin: &mut ChildStdin, message: &ParentMessage) -> std::io::Result<()> {
    let line = encode_line(message)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
