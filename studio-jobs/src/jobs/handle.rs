use tokio::sync::oneshot;

use super::cancel::CancelToken;
use super::error::JobError;

/// Handle to a submitted job.
///
/// Dropping the handle does not cancel the job; it keeps running and keeps
/// publishing events.
pub struct JobHandle<T> {
    job_id: String,
    name: String,
    token: CancelToken,
    outcome: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(
        job_id: String,
        name: String,
        token: CancelToken,
        outcome: oneshot::Receiver<Result<T, JobError>>,
    ) -> Self {
        Self {
            job_id,
            name,
            token,
            outcome,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token shared with the running job, e.g. for a registry cancel action.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Wait for the job to reach a terminal state.
    pub async fn join(self) -> Result<T, JobError> {
        self.outcome.await.unwrap_or_else(|_| Err(supervisor_gone()))
    }

    /// Blocking variant of [`join`](Self::join) for threads outside the
    /// runtime. Panics when called from within an async context.
    pub fn wait_blocking(self) -> Result<T, JobError> {
        self.outcome
            .blocking_recv()
            .unwrap_or_else(|_| Err(supervisor_gone()))
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("name", &self.name)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

fn supervisor_gone() -> JobError {
    JobError::failed("job supervisor stopped before reporting a result")
}
