//! Job lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::EnumDiscriminants;

/// A lifecycle event emitted by a job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub name: String,
    pub at: DateTime<Utc>,
    pub payload: JobEventPayload,
}

/// Event payloads. [`JobEventKind`] is the matching closed set of
/// discriminants used for subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum_discriminants(name(JobEventKind), derive(Hash))]
pub enum JobEventPayload {
    /// An attempt is starting (1-based).
    Started { attempt: u32 },
    /// Progress fraction in `[0, 1]` plus an optional status line.
    Progress {
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// One or more output lines, newline separated.
    LogLine { line: String },
    /// The attempt failed and another one is scheduled after `delay_secs`.
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay_secs: f64,
        error: String,
    },
    Finished {
        #[serde(default)]
        result: serde_json::Value,
    },
    Failed { error: String },
    Cancelled,
    TimedOut { timeout_secs: f64 },
}

impl JobEventPayload {
    pub fn kind(&self) -> JobEventKind {
        JobEventKind::from(self)
    }

    /// Whether this payload ends the job.
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

impl JobEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobEventKind::Finished
                | JobEventKind::Failed
                | JobEventKind::Cancelled
                | JobEventKind::TimedOut
        )
    }
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, name: impl Into<String>, payload: JobEventPayload) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> JobEventKind {
        self.payload.kind()
    }
}
