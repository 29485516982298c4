//! End-to-end behaviour of in-process jobs as seen through the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use studio_jobs::jobs::store::{JobEventStore, JsonlStoreConfig};
use studio_jobs::{
    CancelToken, EventBus, JobError, JobPolicy, JobRegistry, JobRegistryConfig, JobRunner,
    JobRunnerConfig, JobStatus, JobsPolicyConfig, JsonlJobEventStore, PolicyFloor, StudioPaths,
};
use tempfile::TempDir;

struct Harness {
    registry: Arc<JobRegistry>,
    runner: JobRunner,
}

fn harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let registry = JobRegistry::new(bus.clone(), JobRegistryConfig::default(), None);
    let runner = JobRunner::new(bus, JobRunnerConfig::default());
    Harness { registry, runner }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_is_running_then_finished() {
    let h = harness();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = parking_lot::Mutex::new(release_rx);

    let handle = h.runner.submit(
        "train_yolo",
        move |_token, progress| {
            progress.report(0.3, "epoch 3/10");
            release_rx
                .lock()
                .recv_timeout(Duration::from_secs(10))
                .map_err(|e| JobError::failed(e.to_string()))?;
            Ok(json!({"weights": "runs/train/best.pt"}))
        },
        JobPolicy::default(),
    );

    let job = h.registry.get(handle.job_id()).expect("registered on submit");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.name, "train_yolo");

    release_tx.send(()).unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result["weights"], "runs/train/best.pt");

    let jobs = h.registry.list();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.progress, 1.0);
    assert_eq!(job.message.as_deref(), Some("finished"));
    assert_eq!(job.result, Some(json!({"weights": "runs/train/best.pt"})));
    assert!(job.ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pre_cancelled_job_never_runs() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let token = CancelToken::new();
    token.cancel();
    let handle = h.runner.submit_with_token(
        "export_onnx",
        token,
        move |_token, _progress| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        JobPolicy::default(),
    );
    let job_id = handle.job_id().to_string();

    assert!(handle.join().await.unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.registry.get(&job_id).unwrap().status, JobStatus::Cancelled);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test(flavor = "multi_thread")]
async fn test_always_failing_job_attempt_count(#[case] retries: u32) {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let policy = JobPolicy::default()
        .with_retries(retries, Duration::from_millis(2))
        .with_jitter(0.0);

    let handle = h.runner.submit(
        "deploy",
        move |_token, _progress| -> Result<(), JobError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobError::failed("connection refused"))
        },
        policy,
    );
    let job_id = handle.job_id().to_string();
    assert!(handle.join().await.is_err());

    assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
    let job = h.registry.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, retries + 1);
    assert_eq!(job.error.as_deref(), Some("connection refused"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_deadline_stops_early() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let policy = JobPolicy::default()
        .with_retries(50, Duration::from_millis(20))
        .with_jitter(0.0)
        .with_deadline(Duration::from_millis(100));

    let handle = h.runner.submit(
        "sync_dataset",
        move |_token, _progress| -> Result<(), JobError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobError::failed("remote busy"))
        },
        policy,
    );
    assert!(handle.join().await.is_err());

    let attempts = calls.load(Ordering::SeqCst);
    assert!(attempts >= 2, "expected at least one retry, got {attempts}");
    assert!(attempts < 51, "deadline did not stop retries");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_during_backoff() {
    let h = harness();
    let policy = JobPolicy::default()
        .with_retries(3, Duration::from_secs(30))
        .with_jitter(0.0);
    let handle = h.runner.submit(
        "validate",
        |_token, _progress| -> Result<(), JobError> { Err(JobError::failed("flaky")) },
        policy,
    );
    let job_id = handle.job_id().to_string();

    for _ in 0..200 {
        if h.registry.get(&job_id).map(|j| j.status) == Some(JobStatus::Retrying) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.registry.get(&job_id).unwrap().status, JobStatus::Retrying);
    handle.cancel();
    assert!(handle.join().await.unwrap_err().is_cancelled());
    assert_eq!(h.registry.get(&job_id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_marks_timed_out() {
    let h = harness();
    let policy = JobPolicy::default().with_timeout(Duration::from_millis(100));
    let handle = h.runner.submit(
        "sahi_inference",
        |token, progress| -> Result<(), JobError> {
            let mut tile = 0u32;
            loop {
                token.check()?;
                tile += 1;
                progress.report(0.01 * f64::from(tile % 100), format!("tile {tile}"));
                std::thread::sleep(Duration::from_millis(10));
            }
        },
        policy,
    );
    let job_id = handle.job_id().to_string();

    assert!(matches!(handle.join().await, Err(JobError::TimedOut(_))));
    // Late progress from the abandoned body must not reopen the job.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = h.registry.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert_eq!(job.error.as_deref(), Some("timeout after 0.1s"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_writer_lines_reach_registry() {
    let h = harness();
    let handle = h.runner.submit(
        "export_tflite",
        |_token, progress| {
            use std::io::Write;
            let mut out = progress.log_writer();
            writeln!(out, "\x1b[1mconverting\x1b[0m").map_err(JobError::from)?;
            writeln!(out, "quantizing int8").map_err(JobError::from)?;
            out.flush().map_err(JobError::from)?;
            Ok(())
        },
        JobPolicy::default(),
    );
    let job_id = handle.job_id().to_string();
    handle.join().await.unwrap();

    let logs: Vec<String> = h.registry.get(&job_id).unwrap().logs.into_iter().collect();
    assert_eq!(logs, vec!["converting", "quantizing int8"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_policy_from_config_file_drives_runner() {
    let dir = TempDir::new().unwrap();
    let paths = StudioPaths::new(dir.path());
    paths.ensure_dirs().unwrap();
    std::fs::write(
        paths.integrations_config_path(),
        r#"{"jobs": {"default_timeout_sec": "0", "retries": "2", "retry_backoff_sec": 0.001, "retry_jitter": 0}}"#,
    )
    .unwrap();

    let config: JobsPolicyConfig = paths.load_jobs_policy();
    let policy = config.effective(&PolicyFloor::default());
    assert!(policy.timeout.is_none());
    assert_eq!(policy.retries, 2);

    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handle = h.runner.submit(
        "benchmark",
        move |_token, _progress| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(JobError::failed("gpu busy"))
            } else {
                Ok(())
            }
        },
        policy,
    );
    handle.join().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let paths = StudioPaths::new(dir.path());
    let store: Arc<dyn JobEventStore> = Arc::new(
        JsonlJobEventStore::open(paths.job_events_path(), JsonlStoreConfig::default()).unwrap(),
    );

    let finished_id = {
        let bus = Arc::new(EventBus::new());
        let _registry = JobRegistry::new(
            bus.clone(),
            JobRegistryConfig::default(),
            Some(store.clone()),
        );
        let runner = JobRunner::new(bus, JobRunnerConfig::default());
        let handle = runner.submit(
            "export",
            |_token, progress| {
                progress.log("saved model.onnx");
                Ok("model.onnx")
            },
            JobPolicy::default(),
        );
        let id = handle.job_id().to_string();
        handle.join().await.unwrap();
        id
    };

    let bus = Arc::new(EventBus::new());
    let registry = JobRegistry::new(bus, JobRegistryConfig::default(), Some(store));
    let job = registry.get(&finished_id).unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.result, Some(json!("model.onnx")));
    assert!(job.logs.iter().any(|l| l == "saved model.onnx"));

    registry.clear();
    assert!(registry.is_empty());
    assert!(!paths.job_events_path().exists());
}
