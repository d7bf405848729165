//! End-to-end job runs through `JobService` with fake collaborators.

mod common;

use std::collections::BTreeSet;
use std::fs::File;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{collect, count, Harness, ScriptedEngine};
use stemsplit_core::bundle::FileOutcome;
use stemsplit_core::error::CoreError;
use stemsplit_core::job::{JobSettings, JobStatus};
use stemsplit_core::progress::EventKind;
use stemsplit_core::types::JobId;
use stemsplit_pipeline::ServiceError;

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_files_succeed() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["a.wav", "b.wav", "c.wav"]);

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileStarted), 3);
    assert_eq!(count(&events, EventKind::FileCompleted), 3);
    assert_eq!(count(&events, EventKind::JobCompleted), 1);

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobCompleted);
    assert_eq!(last.payload.overall_progress, Some(100.0));

    let bundle = last.payload.bundle.as_ref().unwrap();
    assert_eq!(bundle.succeeded_count(), 3);
    assert_eq!(bundle.archive.as_deref(), Some(format!("{job_id}_stems.zip").as_str()));

    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Completed);
}

#[tokio::test]
async fn sequences_strictly_increase_without_gaps() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (_, sub) = harness.submit_and_start(&["a.wav", "b.wav"]);

    let events = collect(sub).await;

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn file_progress_checkpoints_are_published() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (_, sub) = harness.submit_and_start(&["a.wav"]);

    let events = collect(sub).await;

    let checkpoints: Vec<f32> = events
        .iter()
        .filter(|e| e.payload.current_file.as_deref() == Some("a.wav"))
        .filter_map(|e| e.payload.file_progress)
        .collect();
    assert_eq!(checkpoints, vec![0.0, 30.0, 80.0, 100.0]);

    // Only the update issued under a granted lease names a device.
    let devices: Vec<(&str, Option<f32>)> = events
        .iter()
        .filter_map(|e| e.payload.device.as_deref().map(|d| (d, e.payload.file_progress)))
        .collect();
    assert_eq!(devices, vec![("cpu", Some(30.0))]);
}

#[tokio::test]
async fn device_is_reported_per_granted_lease() {
    let harness = Harness::with_config(ScriptedEngine::new(Duration::ZERO), |config| {
        config.devices = vec!["cuda:0".to_string(), "cuda:1".to_string()];
    });
    let settings = JobSettings {
        device_hint: Some("cuda:1".to_string()),
        ..harness.settings()
    };
    let (_, sub) = harness.submit_and_start_with(&["a.wav", "b.wav"], settings);

    let events = collect(sub).await;

    let devices: Vec<&str> = events
        .iter()
        .filter_map(|e| e.payload.device.as_deref())
        .collect();
    assert_eq!(devices, vec!["cuda:1", "cuda:1"]);
}

#[tokio::test]
async fn stems_are_written_per_input_directory() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["song.wav"]);
    collect(sub).await;

    let dir = harness
        .service
        .config()
        .output_dir
        .join(job_id.to_string())
        .join("song");
    assert!(dir.join("song_vocals.wav").is_file());
    assert!(dir.join("song_accompaniment.wav").is_file());
}

// ---------------------------------------------------------------------------
// Per-file failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_inference_is_recorded_and_job_completes() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["a.wav", "b_fail.wav", "c.wav"]);

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileCompleted), 2);
    assert_eq!(count(&events, EventKind::FileFailed), 1);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobCompleted);

    let bundle = last.payload.bundle.as_ref().unwrap();
    assert_eq!(bundle.succeeded_count(), 2);
    assert_eq!(bundle.failed_count(), 1);
    assert_matches!(&bundle.files[1].outcome, FileOutcome::Failed { error } if error.contains("NaNs"));

    let archive_path = harness
        .service
        .config()
        .output_dir
        .join(format!("{job_id}_stems.zip"));
    let archive = zip::ZipArchive::new(File::open(archive_path).unwrap()).unwrap();
    let top_level: BTreeSet<&str> = archive
        .file_names()
        .filter_map(|n| n.split('/').next())
        .collect();
    assert_eq!(top_level, BTreeSet::from(["a", "c"]));
}

#[tokio::test]
async fn every_file_failing_fails_the_job() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["x_corrupt.wav", "y_fail.wav"]);

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileFailed), 2);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobFailed);
    assert!(last.payload.error.as_deref().unwrap().contains("No input file"));
    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Failed);
}

#[tokio::test]
async fn failure_limit_aborts_the_job() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let settings = JobSettings {
        max_file_failures: Some(1),
        ..harness.settings()
    };
    let (_, sub) = harness.submit_and_start_with(&["a_fail.wav", "b.wav"], settings);

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileStarted), 1);
    assert_eq!(events.last().unwrap().kind, EventKind::JobFailed);
}

#[tokio::test]
async fn unknown_engine_fails_before_any_file() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let settings = JobSettings {
        engine: "missing".to_string(),
        ..Default::default()
    };
    let (_, sub) = harness.submit_and_start_with(&["a.wav"], settings);

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileStarted), 0);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobFailed);
    assert!(last.payload.error.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn device_acquire_timeout_fails_the_job() {
    let (engine, mut gate) = ScriptedEngine::gated();
    let harness = Harness::with_config(engine, |config| {
        config.acquire_timeout = Some(Duration::from_millis(50));
    });

    let (_, holder) = harness.submit_and_start(&["hold.wav"]);
    gate.wait_for_call(0).await;

    let (waiter_id, waiter) = harness.submit_and_start(&["wait.wav"]);
    let events = collect(waiter).await;

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobFailed);
    assert!(last.payload.error.as_deref().unwrap().contains("Timed out"));
    assert_eq!(harness.service.status(waiter_id).unwrap(), JobStatus::Failed);

    gate.release_one();
    assert_eq!(collect(holder).await.last().unwrap().kind, EventKind::JobCompleted);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leases_never_exceed_pool_capacity() {
    let harness = Harness::with_config(ScriptedEngine::new(Duration::from_millis(20)), |config| {
        config.devices = vec!["cuda:0".to_string(), "cuda:1".to_string()];
    });

    let subs: Vec<_> = (0..5)
        .map(|_| harness.submit_and_start(&["a.wav", "b.wav"]).1)
        .collect();
    for sub in subs {
        assert_eq!(collect(sub).await.last().unwrap().kind, EventKind::JobCompleted);
    }

    let status = harness.service.device_status();
    assert_eq!(status.capacity, 2);
    assert!(status.peak_in_use <= 2);
    assert!(harness.engine.peak_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(status.in_use, 0);
    assert_eq!(harness.loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_job_limit_keeps_extra_jobs_queued() {
    let (engine, mut gate) = ScriptedEngine::gated();
    let harness = Harness::with_config(engine, |config| {
        config.max_running_jobs = Some(1);
    });

    let (first, first_sub) = harness.submit_and_start(&["a.wav"]);
    gate.wait_for_call(0).await;
    let (second, second_sub) = harness.submit_and_start(&["b.wav"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.service.status(first).unwrap(), JobStatus::Running);
    assert_eq!(harness.service.status(second).unwrap(), JobStatus::Queued);

    gate.release_one();
    collect(first_sub).await;
    gate.wait_for_call(1).await;
    gate.release_one();
    assert_eq!(collect(second_sub).await.last().unwrap().kind, EventKind::JobCompleted);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_file_finishes_that_file_only() {
    let (engine, mut gate) = ScriptedEngine::gated();
    let harness = Harness::new(engine);
    let (job_id, sub) = harness.submit_and_start(&["a.wav", "b.wav", "c.wav", "d.wav"]);

    // Let file 0 finish, then cancel while file 1 is inside inference.
    gate.wait_for_call(0).await;
    gate.release_one();
    gate.wait_for_call(1).await;
    harness.service.cancel(job_id).unwrap();
    gate.release_one();

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileStarted), 2);
    assert_eq!(
        count(&events, EventKind::FileCompleted) + count(&events, EventKind::FileFailed),
        2
    );
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobCancelled);
    assert_eq!(count(&events, EventKind::JobCancelled), 1);

    // Files had succeeded before the request: a partial archive is built.
    let bundle = last.payload.bundle.as_ref().unwrap();
    assert!(bundle.archive.is_some());
    assert_eq!(bundle.files.len(), 2);
    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_before_first_success_builds_no_archive() {
    let (engine, mut gate) = ScriptedEngine::gated();
    let harness = Harness::new(engine);
    let (job_id, sub) = harness.submit_and_start(&["a.wav", "b.wav"]);

    gate.wait_for_call(0).await;
    harness.service.cancel(job_id).unwrap();
    gate.release_one();

    let events = collect(sub).await;

    assert_eq!(count(&events, EventKind::FileCompleted), 1);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::JobCancelled);
    assert!(last.payload.bundle.is_none());

    let summary = harness.service.summary(job_id).unwrap();
    assert!(summary.cancel_requested);
    assert_eq!(summary.bundle.unwrap().archive, None);
}

#[tokio::test]
async fn cancel_before_start_settles_without_file_events() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let job_id = harness
        .service
        .submit(harness.inputs(&["a.wav"]), harness.settings())
        .unwrap();
    let sub = harness.service.subscribe(job_id).unwrap();

    harness.service.cancel(job_id).unwrap();

    // Settles without ever being started.
    let events = tokio::time::timeout(Duration::from_millis(500), collect(sub))
        .await
        .expect("cancelled job did not settle");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::JobCancelled);
    assert!(events[0].payload.bundle.is_none());

    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Cancelled);
    assert!(!harness.service.bus().is_open(job_id));
    assert_matches!(
        harness.service.start(job_id),
        Err(ServiceError::Core(CoreError::Conflict(_)))
    );
    harness.service.cancel(job_id).unwrap();
    assert_eq!(harness.engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_before_start_removes_uploaded_inputs() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let uploads = harness.dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();
    std::fs::write(uploads.join("a.wav"), b"RIFF").unwrap();
    std::fs::write(uploads.join("b.wav"), b"RIFF").unwrap();

    let job_id = harness
        .service
        .submit(harness.inputs(&["a.wav", "b.wav"]), harness.settings())
        .unwrap();
    harness.service.cancel(job_id).unwrap();

    assert!(!uploads.join("a.wav").exists());
    assert!(!uploads.join("b.wav").exists());
    assert!(!uploads.exists());
}

#[tokio::test]
async fn unstarted_jobs_expire_on_next_submission() {
    let harness = Harness::with_config(ScriptedEngine::new(Duration::ZERO), |config| {
        config.unstarted_job_ttl = Some(Duration::from_millis(10));
    });
    let stale = harness
        .service
        .submit(harness.inputs(&["a.wav"]), harness.settings())
        .unwrap();
    let sub = harness.service.subscribe(stale).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let fresh = harness
        .service
        .submit(harness.inputs(&["b.wav"]), harness.settings())
        .unwrap();

    let events = collect(sub).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::JobFailed);
    assert_eq!(harness.service.status(stale).unwrap(), JobStatus::Failed);
    assert!(!harness.service.bus().is_open(stale));
    assert_matches!(
        harness.service.start(stale),
        Err(ServiceError::Core(CoreError::Conflict(_)))
    );

    assert_eq!(harness.service.status(fresh).unwrap(), JobStatus::Queued);
    assert!(harness.service.bus().is_open(fresh));
}

#[tokio::test]
async fn disabled_ttl_keeps_unstarted_jobs() {
    let harness = Harness::with_config(ScriptedEngine::new(Duration::ZERO), |config| {
        config.unstarted_job_ttl = None;
    });
    let first = harness
        .service
        .submit(harness.inputs(&["a.wav"]), harness.settings())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness
        .service
        .submit(harness.inputs(&["b.wav"]), harness.settings())
        .unwrap();

    assert_eq!(harness.service.status(first).unwrap(), JobStatus::Queued);
}

#[tokio::test]
async fn cancel_on_finished_job_succeeds_without_events() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["a.wav"]);
    collect(sub).await;

    harness.service.cancel(job_id).unwrap();
    harness.service.cancel(job_id).unwrap();

    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Completed);
    assert!(!harness.service.bus().is_open(job_id));
    assert_matches!(
        harness.service.subscribe(job_id),
        Err(ServiceError::Core(CoreError::NotFound(_)))
    );
}

// ---------------------------------------------------------------------------
// Service errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_ids_are_not_found() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let id = JobId::new();

    assert_matches!(harness.service.start(id), Err(ServiceError::Core(CoreError::NotFound(_))));
    assert_matches!(harness.service.cancel(id), Err(ServiceError::Core(CoreError::NotFound(_))));
    assert_matches!(harness.service.status(id), Err(ServiceError::Core(CoreError::NotFound(_))));
    assert_matches!(
        harness.service.subscribe(id),
        Err(ServiceError::Core(CoreError::NotFound(_)))
    );
}

#[tokio::test]
async fn starting_twice_is_a_conflict() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (job_id, sub) = harness.submit_and_start(&["a.wav"]);

    assert_matches!(
        harness.service.start(job_id),
        Err(ServiceError::Core(CoreError::Conflict(_)))
    );
    collect(sub).await;
}

#[tokio::test]
async fn archive_can_be_read_back_by_name() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let (_, sub) = harness.submit_and_start(&["a.wav"]);
    let events = collect(sub).await;
    let archive = events
        .last()
        .and_then(|e| e.payload.bundle.as_ref())
        .and_then(|b| b.archive.clone())
        .unwrap();

    let bytes = harness.service.read_archive(&archive).await.unwrap();
    assert!(bytes.starts_with(b"PK"));

    assert_matches!(
        harness.service.read_archive("../escape.zip").await,
        Err(ServiceError::InvalidArchiveName(_))
    );
}

#[tokio::test]
async fn shutdown_drains_running_jobs() {
    let harness = Harness::new(ScriptedEngine::new(Duration::from_millis(10)));
    let (job_id, sub) = harness.submit_and_start(&["a.wav", "b.wav", "c.wav"]);

    assert!(harness.service.shutdown(Duration::from_secs(5)).await);
    let events = collect(sub).await;

    assert!(events.last().unwrap().is_terminal());
    assert!(harness.service.status(job_id).unwrap().is_terminal());
    assert_eq!(harness.service.running_tasks(), 0);
}

#[tokio::test]
async fn shutdown_settles_unstarted_jobs() {
    let harness = Harness::new(ScriptedEngine::new(Duration::ZERO));
    let job_id = harness
        .service
        .submit(harness.inputs(&["a.wav"]), harness.settings())
        .unwrap();
    let sub = harness.service.subscribe(job_id).unwrap();

    assert!(harness.service.shutdown(Duration::from_secs(5)).await);

    let events = collect(sub).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::JobCancelled);
    assert_eq!(harness.service.status(job_id).unwrap(), JobStatus::Cancelled);
}
