use std::time::Duration;

use thiserror::Error;

/// Outcome error of a job body or a job as a whole.
///
/// Everything except [`JobError::Cancelled`] and [`JobError::TimedOut`] is a
/// transient failure and is eligible for retry.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,

    #[error("job timed out after {:.1}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(JobError::failed("flaky network").is_retryable());
        assert!(JobError::from(anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = JobError::TimedOut(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "job timed out after 1.5s");
    }
}
