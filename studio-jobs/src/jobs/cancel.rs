use tokio_util::sync::CancellationToken;

use super::error::JobError;

/// Cooperative cancellation handle passed to every job body.
///
/// Cancellation never preempts a running job: the body polls
/// [`CancelToken::check`] at its own yield points and returns
/// [`JobError::Cancelled`] to abort.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// `Err(JobError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_after_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(JobError::Cancelled)));
    }
}
