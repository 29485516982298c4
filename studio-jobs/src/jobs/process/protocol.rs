//! JSON-lines protocol between the runner and a worker process.
//!
//! The runner writes [`ParentMessage`]s to the worker's stdin; the worker
//! answers with [`WorkerMessage`]s on stdout, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Always the first line.
    Run {
        job_id: String,
        name: String,
        task: String,
        #[serde(default)]
        params: Value,
    },
    Cancel,
}

/// Messages emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress {
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        line: String,
    },
    Result {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
    },
    Cancelled,
}

impl WorkerMessage {
    /// Parse one stdout line. `None` means the line is plain output, not a
    /// protocol message.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

/// Encode a message as a single protocol line, newline included.
pub fn encode_line<M: Serialize>(message: &M) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// What the worker should run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: String,
    #[serde(default)]
    pub params: Value,
}

impl WorkerRequest {
    pub fn new(task: impl Into<String>, params: Value) -> Self {
        Self {
            task: task.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_message_shape() {
        let msg = ParentMessage::Run {
            job_id: "abc".into(),
            name: "export".into(),
            task: "sleep".into(),
            params: json!({"steps": 3}),
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "run");
        assert_eq!(value["params"]["steps"], 3);

        assert_eq!(
            encode_line(&ParentMessage::Cancel).unwrap(),
            "{\"type\":\"cancel\"}\n"
        );
    }

    #[test]
    fn test_parse_worker_lines() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"progress","progress":0.25,"message":"step 1"}"#),
            Some(WorkerMessage::Progress {
                progress: 0.25,
                message: Some("step 1".into())
            })
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"cancelled"}"#),
            Some(WorkerMessage::Cancelled)
        );
        assert_eq!(
            WorkerMessage::parse(r#"  {"type":"result"}  "#),
            Some(WorkerMessage::Result { value: Value::Null })
        );
        assert_eq!(WorkerMessage::parse("Epoch 1/10 loss=0.3"), None);
        assert_eq!(WorkerMessage::parse(r#"{"type":"telemetry"}"#), None);
        assert_eq!(WorkerMessage::parse("{broken"), None);
    }
}
