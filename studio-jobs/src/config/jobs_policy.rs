//! Persisted job policy and the floor callers combine it with.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::jobs::JobPolicy;
use crate::jobs::policy::MAX_BACKOFF;

/// Job policy as stored in the integrations config file.
///
/// Accepts either a flat object or one nested under a top-level `"jobs"`
/// key. Values may be numbers or numeric strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsPolicyConfig {
    /// Per-attempt timeout in seconds, 0 for unlimited.
    pub default_timeout_sec: f64,
    pub retries: u32,
    pub retry_backoff_sec: f64,
    /// Clamped to `[0, 1]`.
    pub retry_jitter: f64,
    /// 0 for no deadline.
    pub retry_deadline_sec: f64,
}

impl Default for JobsPolicyConfig {
    fn default() -> Self {
        Self {
            default_timeout_sec: 900.0,
            retries: 0,
            retry_backoff_sec: 1.0,
            retry_jitter: 0.3,
            retry_deadline_sec: 0.0,
        }
    }
}

/// Minimums a call site imposes on the configured policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolicyFloor {
    pub min_timeout_sec: f64,
    pub min_retries: u32,
    pub min_backoff_sec: f64,
}

impl PolicyFloor {
    pub fn new(min_timeout_sec: f64, min_retries: u32, min_backoff_sec: f64) -> Self {
        Self {
            min_timeout_sec,
            min_retries,
            min_backoff_sec,
        }
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

impl JobsPolicyConfig {
    /// Build from an already parsed JSON document. Unknown or malformed
    /// fields keep their defaults.
    pub fn from_value(doc: &Value) -> Self {
        let defaults = Self::default();
        let section = match doc.get("jobs") {
            Some(jobs @ Value::Object(_)) => jobs,
            _ => doc,
        };

        let field = |key: &str| number(section.get(key));

        Self {
            default_timeout_sec: field("default_timeout_sec")
                .map_or(defaults.default_timeout_sec, |v| v.max(0.0)),
            retries: field("retries")
                .map_or(defaults.retries, |v| v.clamp(0.0, u32::MAX as f64) as u32),
            retry_backoff_sec: field("retry_backoff_sec")
                .map_or(defaults.retry_backoff_sec, |v| v.max(0.0)),
            retry_jitter: field("retry_jitter")
                .map_or(defaults.retry_jitter, |v| v.clamp(0.0, 1.0)),
            retry_deadline_sec: field("retry_deadline_sec")
                .map_or(defaults.retry_deadline_sec, |v| v.max(0.0)),
        }
    }

    /// Parse a JSON string, falling back to defaults when it is malformed.
    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(doc) => Self::from_value(&doc),
            Err(e) => {
                warn!("Malformed jobs policy config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Load from a config file. A missing or unreadable file yields defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No jobs policy config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!(
                    "Failed to read jobs policy config {}: {}, using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Runner policy with `floor` applied field by field.
    ///
    /// The floor only raises values; a configured value above it wins.
    pub fn effective(&self, floor: &PolicyFloor) -> JobPolicy {
        let timeout_sec = self.default_timeout_sec.max(floor.min_timeout_sec.max(0.0));
        let backoff_sec = self.retry_backoff_sec.max(floor.min_backoff_sec.max(0.0));

        JobPolicy {
            timeout: limit(timeout_sec),
            retries: self.retries.max(floor.min_retries),
            retry_backoff: Duration::try_from_secs_f64(backoff_sec)
                .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF)),
            retry_jitter: self.retry_jitter.clamp(0.0, 1.0),
            retry_deadline: limit(self.retry_deadline_sec),
        }
    }
}

/// Seconds to an optional limit. Zero, negative and values too large for a
/// `Duration` mean no limit.
fn limit(secs: f64) -> Option<Duration> {
    if secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
