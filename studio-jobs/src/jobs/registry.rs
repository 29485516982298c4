//! UI-facing registry of jobs, built from the event stream.
//!
//! The registry only consumes events: it never talks to a runner. Control
//! actions (cancel, rerun) are attached by whoever submitted the job, since
//! only the caller knows how to resubmit with the same arguments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info};

use super::progress::clamp_progress;
use super::store::JobEventStore;
use crate::events::{EventBus, JobEvent, JobEventHandler, JobEventPayload, SubscriptionId};

/// Error recorded for jobs that were still active when the process ended.
pub const INTERRUPTED: &str = "interrupted";

/// Control action attached to a job record.
pub type JobAction = Arc<dyn Fn() + Send + Sync>;

/// Status of a job as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Running,
    Retrying,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Point-in-time snapshot of one job.
#[derive(Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub logs: VecDeque<String>,
    #[serde(skip)]
    pub cancel: Option<JobAction>,
    #[serde(skip)]
    pub rerun: Option<JobAction>,
}

impl std::fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRecord")
            .field("job_id", &self.job_id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("message", &self.message)
            .field("error", &self.error)
            .field("attempt", &self.attempt)
            .field("logs", &self.logs.len())
            .field("cancel", &self.cancel.is_some())
            .field("rerun", &self.rerun.is_some())
            .finish()
    }
}

impl JobRecord {
    fn new(job_id: &str, name: &str, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            status: JobStatus::Running,
            progress: 0.0,
            message: None,
            error: None,
            result: None,
            attempt: 1,
            started_at: at,
            ended_at: None,
            logs: VecDeque::new(),
            cancel: None,
            rerun: None,
        }
    }

    /// Cancel is offered while the job is active and an action is attached.
    pub fn can_cancel(&self) -> bool {
        self.status.is_active() && self.cancel.is_some()
    }

    /// Rerun is offered once the job is terminal and an action is attached.
    pub fn can_rerun(&self) -> bool {
        self.status.is_terminal() && self.rerun.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    fn finish(&mut self, status: JobStatus, at: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(at);
    }
}

/// Configuration for [`JobRegistry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRegistryConfig {
    /// Oldest jobs are dropped beyond this count. 0 keeps everything.
    pub max_jobs: usize,
    /// Per-job log lines kept (newest win).
    pub max_log_lines: usize,
    /// Rebuild history from the event store on construction.
    pub replay_on_start: bool,
}

impl Default for JobRegistryConfig {
    fn default() -> Self {
        Self {
            max_jobs: 200,
            max_log_lines: 400,
            replay_on_start: true,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, JobRecord>,
    /// Insertion order of `jobs`.
    order: VecDeque<String>,
}

impl RegistryState {
    fn ensure(&mut self, event: &JobEvent) -> &mut JobRecord {
        if !self.jobs.contains_key(&event.job_id) {
            self.order.push_back(event.job_id.clone());
        }
        self.jobs
            .entry(event.job_id.clone())
            .or_insert_with(|| JobRecord::new(&event.job_id, &event.name, event.at))
    }

    fn purge(&mut self, max_jobs: usize) {
        if max_jobs == 0 {
            return;
        }
        while self.jobs.len() > max_jobs {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.jobs.remove(&oldest);
        }
    }
}

/// Registry of jobs fed by the event bus.
pub struct JobRegistry {
    config: JobRegistryConfig,
    state: Mutex<RegistryState>,
    store: Option<Arc<dyn JobEventStore>>,
    bus: Arc<EventBus>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl JobRegistry {
    /// Create a registry, replay persisted history and subscribe to `bus`.
    ///
    /// The bus holds the registry weakly; dropping the last `Arc` ends the
    /// subscription.
    pub fn new(
        bus: Arc<EventBus>,
        config: JobRegistryConfig,
        store: Option<Arc<dyn JobEventStore>>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            state: Mutex::new(RegistryState::default()),
            store,
            bus: bus.clone(),
            subscription: Mutex::new(None),
        });

        if registry.config.replay_on_start {
            registry.replay();
        }

        let id = bus.subscribe_all_weak(&registry);
        *registry.subscription.lock() = Some(id);
        registry
    }

    pub fn config(&self) -> &JobRegistryConfig {
        &self.config
    }

    /// Snapshot of all jobs in insertion order.
    pub fn list(&self) -> Vec<JobRecord> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal jobs and drop the persisted history.
    pub fn clear(&self) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.jobs.len();
            state.jobs.retain(|_, job| job.status.is_active());
            let RegistryState { jobs, order } = &mut *state;
            order.retain(|id| jobs.contains_key(id));
            before - jobs.len()
        };
        if let Some(store) = &self.store {
            store.clear();
        }
        info!("Cleared {} finished job(s)", removed);
    }

    /// Attach a cancel action. Returns `false` for unknown jobs.
    pub fn set_cancel(&self, job_id: &str, action: JobAction) -> bool {
        match self.state.lock().jobs.get_mut(job_id) {
            Some(job) => {
                job.cancel = Some(action);
                true
            }
            None => false,
        }
    }

    /// Attach a rerun action. Returns `false` for unknown jobs.
    pub fn set_rerun(&self, job_id: &str, action: JobAction) -> bool {
        match self.state.lock().jobs.get_mut(job_id) {
            Some(job) => {
                job.rerun = Some(action);
                true
            }
            None => false,
        }
    }

    /// Invoke the cancel action if the job currently allows it.
    pub fn cancel(&self, job_id: &str) -> bool {
        let action = self
            .get(job_id)
            .filter(JobRecord::can_cancel)
            .and_then(|job| job.cancel);
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Invoke the rerun action if the job currently allows it.
    pub fn rerun(&self, job_id: &str) -> bool {
        let action = self
            .get(job_id)
            .filter(JobRecord::can_rerun)
            .and_then(|job| job.rerun);
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Fold one event into the registry without persisting it.
    fn apply(&self, event: &JobEvent) {
        let max_log_lines = self.config.max_log_lines;
        let mut state = self.state.lock();

        match &event.payload {
            JobEventPayload::Started { attempt } => {
                let job = state.ensure(event);
                job.status = JobStatus::Running;
                job.attempt = *attempt;
                job.ended_at = None;
                state.purge(self.config.max_jobs);
            }
            JobEventPayload::LogLine { line } => {
                let job = state.ensure(event);
                job.logs.extend(line.split('\n').map(str::to_string));
                while job.logs.len() > max_log_lines {
                    job.logs.pop_front();
                }
            }
            payload => {
                let job = state.ensure(event);
                // Late reports from an abandoned attempt must not reopen a
                // finished job.
                if job.status.is_terminal() {
                    debug!(
                        "Ignoring {:?} for job {} in state {}",
                        payload.kind(),
                        job.job_id,
                        job.status
                    );
                    return;
                }
                match payload {
                    JobEventPayload::Progress { progress, message } => {
                        job.progress = clamp_progress(*progress);
                        if message.is_some() {
                            job.message = message.clone();
                        }
                    }
                    JobEventPayload::Retrying {
                        attempt,
                        max_attempts,
                        error,
                        ..
                    } => {
                        job.status = JobStatus::Retrying;
                        job.message = Some(format!("retry {}/{}: {}", attempt, max_attempts, error));
                        job.error = Some(error.clone());
                    }
                    JobEventPayload::Finished { result } => {
                        job.progress = 1.0;
                        job.result = Some(result.clone());
                        job.finish(JobStatus::Finished, event.at);
                    }
                    JobEventPayload::Failed { error } => {
                        job.error = Some(error.clone());
                        job.finish(JobStatus::Failed, event.at);
                    }
                    JobEventPayload::Cancelled => {
                        job.finish(JobStatus::Cancelled, event.at);
                    }
                    JobEventPayload::TimedOut { timeout_secs } => {
                        job.error = Some(format!("timeout after {:.1}s", timeout_secs));
                        job.finish(JobStatus::TimedOut, event.at);
                    }
                    JobEventPayload::Started { .. } | JobEventPayload::LogLine { .. } => {}
                }
            }
        }
    }

    fn replay(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let events = store.load();
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.apply(event);
        }

        let now = Utc::now();
        let mut state = self.state.lock();
        let mut interrupted = 0usize;
        for job in state.jobs.values_mut().filter(|job| job.status.is_active()) {
            job.error = Some(INTERRUPTED.to_string());
            job.finish(JobStatus::Failed, now);
            interrupted += 1;
        }
        state.purge(self.config.max_jobs);
        info!(
            "Replayed {} job event(s) into {} job(s), {} interrupted",
            events.len(),
            state.jobs.len(),
            interrupted
        );
    }
}

impl JobEventHandler for JobRegistry {
    fn handle(&self, event: &JobEvent) {
        self.apply(event);
        if let Some(store) = &self.store {
            store.append(event);
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.bus.unsubscribe(id);
        }
    }
}
