//! Attempt loop shared by the in-process and out-of-process runners.
//!
//! The supervisor owns the lifecycle events of a job: it decides when an
//! attempt is retried, timed out, cancelled or finished, and publishes the
//! matching event. Runners only provide the future for one attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::error::JobError;
use super::policy::JobPolicy;
use crate::events::{EventBus, JobEvent, JobEventPayload};

/// Identity of a job plus the bus its events go to.
#[derive(Clone)]
pub(crate) struct JobContext {
    pub bus: Arc<EventBus>,
    pub job_id: String,
    pub name: String,
    pub token: CancelToken,
}

impl JobContext {
    pub fn new(bus: Arc<EventBus>, name: &str, token: CancelToken) -> Self {
        Self {
            bus,
            job_id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            token,
        }
    }

    pub fn publish(&self, payload: JobEventPayload) {
        self.bus
            .publish(&JobEvent::new(&self.job_id, &self.name, payload));
    }

    pub fn progress(&self, progress: f64, message: impl Into<String>) {
        self.publish(JobEventPayload::Progress {
            progress,
            message: Some(message.into()),
        });
    }

    /// Events published synchronously on submission.
    pub fn announce(&self) {
        self.publish(JobEventPayload::Started { attempt: 1 });
        self.progress(0.0, "started");
    }

    fn cancelled<T>(&self) -> Result<T, JobError> {
        info!("Job {} ({}) cancelled", self.name, self.job_id);
        self.publish(JobEventPayload::Cancelled);
        Err(JobError::Cancelled)
    }
}

/// Cancel tokens of jobs that have not reached a terminal state.
#[derive(Default)]
pub(crate) struct InFlight {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl InFlight {
    pub fn insert(&self, job_id: &str, token: &CancelToken) {
        self.tokens.lock().insert(job_id.to_string(), token.clone());
    }

    pub fn remove(&self, job_id: &str) {
        self.tokens.lock().remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Cancel every in-flight job. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancelToken> = self.tokens.lock().values().cloned().collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }
}

/// Run attempts produced by `run_attempt` until one succeeds or the policy
/// gives up.
///
/// `run_attempt` receives the 1-based attempt number. A timed out attempt
/// future is dropped, which cancels whatever it was driving.
pub(crate) async fn supervise<T, F, Fut>(
    ctx: &JobContext,
    policy: &JobPolicy,
    mut run_attempt: F,
) -> Result<T, JobError>
where
    T: Serialize,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    let first_started = Instant::now();
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        if ctx.token.is_cancelled() {
            return ctx.cancelled();
        }

        debug!(
            "Job {} ({}) attempt {}/{}",
            ctx.name, ctx.job_id, attempt, max_attempts
        );

        let outcome = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, run_attempt(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::TimedOut(limit)),
            },
            None => run_attempt(attempt).await,
        };

        let error = match outcome {
            Ok(_) if ctx.token.is_cancelled() => return ctx.cancelled(),
            Ok(value) => {
                let result = serde_json::to_value(&value).unwrap_or_else(|e| {
                    warn!("Job {} result is not serializable: {}", ctx.job_id, e);
                    serde_json::Value::Null
                });
                ctx.progress(1.0, "finished");
                ctx.publish(JobEventPayload::Finished { result });
                info!("Job {} ({}) finished", ctx.name, ctx.job_id);
                return Ok(value);
            }
            Err(JobError::TimedOut(limit)) => {
                ctx.token.cancel();
                warn!(
                    "Job {} ({}) timed out after {:.1}s",
                    ctx.name,
                    ctx.job_id,
                    limit.as_secs_f64()
                );
                ctx.publish(JobEventPayload::TimedOut {
                    timeout_secs: limit.as_secs_f64(),
                });
                return Err(JobError::TimedOut(limit));
            }
            Err(JobError::Cancelled) => return ctx.cancelled(),
            Err(_) if ctx.token.is_cancelled() => return ctx.cancelled(),
            Err(e) => e,
        };

        let message = error.to_string();
        if !error.is_retryable() || !policy.should_retry(attempt, first_started.elapsed()) {
            warn!(
                "Job {} ({}) failed after {} attempt(s): {}",
                ctx.name, ctx.job_id, attempt, message
            );
            ctx.publish(JobEventPayload::Failed { error: message });
            return Err(error);
        }

        let delay = policy.delay_for_retry(attempt);
        warn!(
            "Job {} ({}) attempt {}/{} failed, retrying in {:.1}s: {}",
            ctx.name,
            ctx.job_id,
            attempt,
            max_attempts,
            delay.as_secs_f64(),
            message
        );
        ctx.publish(JobEventPayload::Retrying {
            attempt,
            max_attempts,
            delay_secs: delay.as_secs_f64(),
            error: message,
        });
        let fraction = ((attempt - 1) as f64 / max_attempts as f64).min(0.95);
        ctx.progress(fraction, format!("retrying in {:.1}s", delay.as_secs_f64()));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.token.cancelled() => {
                return ctx.cancelled();
            }
        }

        attempt += 1;
        ctx.publish(JobEventPayload::Started { attempt });
    }
}
