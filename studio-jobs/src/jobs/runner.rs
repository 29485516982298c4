//! In-process job runner.
//!
//! Job bodies are blocking closures executed on the tokio blocking pool;
//! a semaphore bounds how many run at once. Supervision (timeouts, retries,
//! lifecycle events) happens on the async side.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, info};

use super::cancel::CancelToken;
use super::error::JobError;
use super::handle::JobHandle;
use super::policy::JobPolicy;
use super::progress::{EventBusSink, LogBatchConfig, ProgressReporter};
use super::supervisor::{InFlight, JobContext, supervise};
use crate::events::EventBus;

/// Configuration for [`JobRunner`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunnerConfig {
    /// Maximum number of job bodies running concurrently.
    pub max_workers: usize,
    /// Batching of log lines published on the bus.
    pub log_batch: LogBatchConfig,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            log_batch: LogBatchConfig::default(),
        }
    }
}

/// Runs blocking job bodies with cancellation, timeout and retry handling.
pub struct JobRunner {
    bus: Arc<EventBus>,
    config: JobRunnerConfig,
    permits: Arc<Semaphore>,
    runtime: Handle,
    in_flight: Arc<InFlight>,
}

impl JobRunner {
    /// Create a runner bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) in that case.
    pub fn new(bus: Arc<EventBus>, config: JobRunnerConfig) -> Self {
        Self::with_runtime(bus, config, Handle::current())
    }

    /// Create a runner that spawns its supervisors on `runtime`.
    pub fn with_runtime(bus: Arc<EventBus>, config: JobRunnerConfig, runtime: Handle) -> Self {
        let workers = config.max_workers.max(1);
        info!("Starting job runner with {} workers", workers);
        Self {
            bus,
            permits: Arc::new(Semaphore::new(workers)),
            config,
            runtime,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    /// Number of submitted jobs that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Submit a job body.
    ///
    /// `Started` and an initial `Progress` event are published before this
    /// returns. The body may run several times when the policy allows
    /// retries, so it takes shared references and must be `Fn`.
    pub fn submit<T, F>(&self, name: &str, body: F, policy: JobPolicy) -> JobHandle<T>
    where
        T: Serialize + Send + 'static,
        F: Fn(&CancelToken, &ProgressReporter) -> Result<T, JobError> + Send + Sync + 'static,
    {
        self.submit_with_token(name, CancelToken::new(), body, policy)
    }

    /// Like [`submit`](Self::submit) with a caller-owned cancel token. A
    /// token that is already cancelled ends the job without running `body`.
    pub fn submit_with_token<T, F>(
        &self,
        name: &str,
        token: CancelToken,
        body: F,
        policy: JobPolicy,
    ) -> JobHandle<T>
    where
        T: Serialize + Send + 'static,
        F: Fn(&CancelToken, &ProgressReporter) -> Result<T, JobError> + Send + Sync + 'static,
    {
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
        let body = Arc::new(body);
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();

        self.runtime.spawn(async move {
            let outcome = supervise(&ctx, &policy, |attempt| {
                run_attempt(
                    attempt,
                    body.clone(),
                    ctx.token.clone(),
                    reporter.clone(),
                    permits.clone(),
                )
            })
            .await;

            in_flight.remove(&ctx.job_id);
            if tx.send(outcome).is_err() {
                debug!("Job {} handle dropped before completion", ctx.job_id);
            }
        });

        handle
    }

    /// Cancel every in-flight job. Bodies stop at their next cancellation
    /// check.
    pub fn shutdown(&self) {
        let count = self.in_flight.cancel_all();
        info!("Job runner shutting down, cancelled {} job(s)", count);
    }
}

async fn run_attempt<T, F>(
    attempt: u32,
    body: Arc<F>,
    token: CancelToken,
    reporter: ProgressReporter,
    permits: Arc<Semaphore>,
) -> Result<T, JobError>
where
    T: Send + 'static,
    F: Fn(&CancelToken, &ProgressReporter) -> Result<T, JobError> + Send + Sync + 'static,
{
    // A queued job stays cancellable while it waits for a slot.
    let permit = tokio::select! {
        permit = permits.acquire_owned() => {
            permit.map_err(|_| JobError::failed("job runner is closed"))?
        }
        _ = token.cancelled() => return Err(JobError::Cancelled),
    };
    token.check()?;

    debug!("Running attempt {} on the blocking pool", attempt);
    // The permit moves into the blocking task so a timed out body still
    // holds its slot until it actually returns.
    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let result = body(&token, &reporter);
        reporter.flush();
        result
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::failed(format!(
            "job panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(JobError::failed(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{JobEvent, JobEventHandler, JobEventKind, JobEventPayload};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JobEvent>>);

    impl JobEventHandler for Recorder {
        fn handle(&self, event: &JobEvent) {
            self.0.lock().push(event.clone());
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<JobEventKind> {
            self.0.lock().iter().map(JobEvent::kind).collect()
        }
    }

    fn runner() -> (JobRunner, Arc<Recorder>) {
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_all(recorder.clone());
        (JobRunner::new(bus, JobRunnerConfig::default()), recorder)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_publishes_lifecycle() {
        let (runner, recorder) = runner();
        let handle = runner.submit(
            "export",
            |_token, progress| {
                progress.report(0.5, "halfway");
                progress.log("wrote model.onnx");
                Ok(42u32)
            },
            JobPolicy::default(),
        );

        assert_eq!(handle.join().await.unwrap(), 42);
        let kinds = recorder.kinds();
        assert_eq!(kinds.first(), Some(&JobEventKind::Started));
        assert_eq!(kinds.last(), Some(&JobEventKind::Finished));
        assert!(kinds.contains(&JobEventKind::LogLine));

        let events = recorder.0.lock();
        let finished = events.last().unwrap();
        assert_eq!(
            finished.payload,
            JobEventPayload::Finished {
                result: serde_json::json!(42)
            }
        );
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retries_until_budget_exhausted() {
        let (runner, recorder) = runner();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = JobPolicy::default()
            .with_retries(2, Duration::from_millis(5))
            .with_jitter(0.0);

        let handle = runner.submit(
            "flaky",
            move |_token, _progress| -> Result<(), JobError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(JobError::failed("network unreachable"))
            },
            policy,
        );

        let err = handle.join().await.unwrap_err();
        assert_eq!(err.to_string(), "network unreachable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let kinds = recorder.kinds();
        let retrying = kinds.iter().filter(|k| **k == JobEventKind::Retrying).count();
        let started = kinds.iter().filter(|k| **k == JobEventKind::Started).count();
        assert_eq!(retrying, 2);
        assert_eq!(started, 3);
        assert_eq!(kinds.last(), Some(&JobEventKind::Failed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panic_is_a_transient_failure() {
        let (runner, _recorder) = runner();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = JobPolicy::default()
            .with_retries(1, Duration::from_millis(5))
            .with_jitter(0.0);

        let handle = runner.submit(
            "panicky",
            move |_token, _progress| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt explodes");
                }
                Ok("recovered")
            },
            policy,
        );

        assert_eq!(handle.join().await.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_is_never_retried() {
        let (runner, recorder) = runner();
        let policy = JobPolicy::default().with_retries(5, Duration::from_millis(5));
        let handle = runner.submit(
            "train",
            |token, _progress| -> Result<(), JobError> {
                loop {
                    token.check()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            },
            policy,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
        assert!(handle.join().await.unwrap_err().is_cancelled());

        let kinds = recorder.kinds();
        assert!(!kinds.contains(&JobEventKind::Retrying));
        assert_eq!(kinds.last(), Some(&JobEventKind::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_is_terminal() {
        let (runner, recorder) = runner();
        let policy = JobPolicy::default()
            .with_timeout(Duration::from_millis(50))
            .with_retries(3, Duration::from_millis(5));
        let handle = runner.submit(
            "validate",
            |token, _progress| -> Result<(), JobError> {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(JobError::Cancelled)
            },
            policy,
        );

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, JobError::TimedOut(_)));
        let kinds = recorder.kinds();
        assert!(kinds.contains(&JobEventKind::TimedOut));
        assert!(!kinds.contains(&JobEventKind::Retrying));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_in_flight() {
        let (runner, _recorder) = runner();
        let handle = runner.submit(
            "sahi",
            |token, _progress| -> Result<(), JobError> {
                loop {
                    token.check()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            },
            JobPolicy::default(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.shutdown();
        assert!(handle.join().await.unwrap_err().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_while_waiting_for_slot() {
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_all(recorder.clone());
        let runner = JobRunner::new(
            bus,
            JobRunnerConfig {
                max_workers: 1,
                ..Default::default()
            },
        );

        let running = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = running.clone();
        let busy = runner.submit(
            "train",
            move |token, _progress| -> Result<(), JobError> {
                flag.store(true, Ordering::SeqCst);
                loop {
                    token.check()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            },
            JobPolicy::default(),
        );
        while !running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let queued = runner.submit(
            "export",
            move |_token, _progress| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            JobPolicy::default(),
        );
        let queued_id = queued.job_id().to_string();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queued.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), queued.join())
            .await
            .expect("queued job should resolve without waiting for a slot");
        assert!(outcome.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(recorder.0.lock().iter().any(|e| {
            e.job_id == queued_id && e.payload == JobEventPayload::Cancelled
        }));

        busy.cancel();
        assert!(busy.join().await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_wait_blocking_from_plain_thread() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let runner = JobRunner::with_runtime(
            Arc::new(EventBus::new()),
            JobRunnerConfig::default(),
            rt.handle().clone(),
        );
        let handle = runner.submit("echo", |_t, _p| Ok("done"), JobPolicy::default());
        assert_eq!(handle.wait_blocking().unwrap(), "done");
    }
}
