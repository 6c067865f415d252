//! Upload followed by asynchronous duplicate checks, all in memory.
//!
//! Run with: cargo test --test pipeline_test

mod helpers;

use async_trait::async_trait;
use futures::future::join_all;
use helpers::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use photo_dedup::db::PhotoRepository;
use photo_dedup::models::job::{JobEnvelope, Verdict};
use photo_dedup::models::photo::DuplicateStatus;
use photo_dedup::services::detector::{DetectError, DuplicateDetector, PerceptualDetector};
use photo_dedup::services::fingerprint::MemoryFingerprintStore;
use photo_dedup::services::queue::JobQueue;
use photo_dedup::services::retry::RetryPolicy;
use photo_dedup::worker::{JobOutcome, Worker, WorkerConfig};

fn worker_config(max_attempts: u32) -> WorkerConfig {
    WorkerConfig {
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        },
        job_timeout: Duration::from_secs(5),
        poll_wait: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
    }
}

fn worker(env: &TestEnv, detector: Arc<dyn DuplicateDetector>, max_attempts: u32) -> Worker {
    Worker::new(
        "test",
        env.queue.clone(),
        detector,
        env.photos.clone(),
        worker_config(max_attempts),
    )
}

fn perceptual(env: &TestEnv) -> Arc<dyn DuplicateDetector> {
    Arc::new(PerceptualDetector::new(
        env.blobs.clone(),
        Arc::new(MemoryFingerprintStore::new()),
        4,
    ))
}

async fn status_of(env: &TestEnv, id: Uuid) -> DuplicateStatus {
    env.photos
        .find_photo_by_id(id)
        .await
        .unwrap()
        .expect("photo exists")
        .duplicate_status
}

/// Upload `a`, `b`, then `a` again and let one worker drain the queue.
async fn upload_and_check(env: &TestEnv) -> Vec<Uuid> {
    let report = env
        .upload
        .upload_batch(vec![
            file("a.png", noise_png(1)),
            file("b.png", noise_png(2)),
            file("a-again.png", noise_png(1)),
        ])
        .await
        .unwrap();
    let ids: Vec<Uuid> = report.uploaded.iter().map(|p| p.id).collect();

    let worker = worker(env, perceptual(env), 3);
    while worker.process_next().await.unwrap().is_some() {}
    ids
}

#[tokio::test]
async fn test_reupload_is_marked_duplicate_of_original() {
    let env = TestEnv::new();
    let ids = upload_and_check(&env).await;

    assert_eq!(status_of(&env, ids[0]).await, DuplicateStatus::Unique);
    assert_eq!(status_of(&env, ids[1]).await, DuplicateStatus::Unique);
    assert_eq!(
        status_of(&env, ids[2]).await,
        DuplicateStatus::DuplicateOf(ids[0])
    );
}

#[tokio::test]
async fn test_redelivered_job_yields_same_status() {
    let env = TestEnv::new();
    let ids = upload_and_check(&env).await;
    let detector = perceptual(&env);

    let worker = worker(&env, detector.clone(), 3);
    for id in &ids {
        let photo = env.photos.find_photo_by_id(*id).await.unwrap().unwrap();
        env.queue
            .enqueue(JobEnvelope::new(photo.id, photo.url))
            .await
            .unwrap();
    }
    let mut first_pass = Vec::new();
    while let Some(outcome) = worker.process_next().await.unwrap() {
        first_pass.push(outcome);
    }

    for id in &ids {
        let photo = env.photos.find_photo_by_id(*id).await.unwrap().unwrap();
        env.queue
            .enqueue(JobEnvelope::new(photo.id, photo.url))
            .await
            .unwrap();
    }
    let mut second_pass = Vec::new();
    while let Some(outcome) = worker.process_next().await.unwrap() {
        second_pass.push(outcome);
    }

    assert_eq!(first_pass, second_pass);
    assert_eq!(
        second_pass[2],
        JobOutcome::Completed(Verdict::DuplicateOf(ids[0]))
    );
    assert_eq!(
        status_of(&env, ids[2]).await,
        DuplicateStatus::DuplicateOf(ids[0])
    );
}

#[tokio::test]
async fn test_same_inputs_give_same_statuses() {
    let first = TestEnv::new();
    let second = TestEnv::new();
    let first_ids = upload_and_check(&first).await;
    let second_ids = upload_and_check(&second).await;

    for (a, b) in first_ids.iter().zip(&second_ids) {
        let left = status_of(&first, *a).await;
        let right = status_of(&second, *b).await;
        assert_eq!(left.kind(), right.kind());
    }
}

#[tokio::test]
async fn test_upload_does_not_wait_for_slow_check() {
    let env = TestEnv::new();
    let detector = Arc::new(SlowDetector::new(Duration::from_secs(1)));
    let worker = Arc::new(worker(&env, detector.clone(), 3));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    let start = Instant::now();
    let report = env
        .upload
        .upload_batch(vec![file("a.png", noise_png(1))])
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(report.uploaded[0].duplicate_status, DuplicateStatus::Unknown);

    let id = report.uploaded[0].id;
    let photos = env.photos.clone();
    assert!(
        eventually(|| {
            photos
                .all()
                .iter()
                .any(|p| p.id == id && p.duplicate_status == DuplicateStatus::Unique)
        })
        .await
    );
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failing_check_is_dead_lettered_after_max_attempts() {
    let env = TestEnv::new();
    let detector = Arc::new(FailingDetector::default());
    let worker = worker(&env, detector.clone(), 3);

    let report = env
        .upload
        .upload_batch(vec![file("a.png", noise_png(1))])
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.process_next().await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2], JobOutcome::DeadLettered);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 3);

    let dead = env.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.photo_id, report.uploaded[0].id);
    assert_eq!(dead[0].attempt, 3);
    assert!(dead[0].last_error.is_some());

    // The photo stays, with its status unknown.
    assert_eq!(
        status_of(&env, report.uploaded[0].id).await,
        DuplicateStatus::Unknown
    );
    assert!(worker.process_next().await.unwrap().is_none());
}

/// Records which photos it was asked about.
#[derive(Default)]
struct RecordingDetector {
    seen: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl DuplicateDetector for RecordingDetector {
    async fn check(&self, envelope: &JobEnvelope) -> Result<Verdict, DetectError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.seen.lock().unwrap().push(envelope.photo_id);
        Ok(Verdict::Unique)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_never_share_a_job() {
    let env = TestEnv::new();
    let files = (0..40).map(|i| file(&format!("{i}.png"), noise_png(i))).collect();
    let report = env.upload.upload_batch(files).await.unwrap();
    assert_eq!(report.uploaded.len(), 40);

    let detector = Arc::new(RecordingDetector::default());
    let workers: Vec<Worker> = (0..4)
        .map(|n| {
            Worker::new(
                format!("worker-{n}"),
                env.queue.clone(),
                detector.clone(),
                env.photos.clone(),
                worker_config(3),
            )
        })
        .collect();

    join_all(workers.iter().map(|worker| async move {
        while worker.process_next().await.unwrap().is_some() {}
    }))
    .await;

    let seen = detector.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 40);
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for id in seen {
        *counts.entry(id).or_default() += 1;
    }
    assert!(counts.values().all(|&n| n == 1));
    assert!(env
        .photos
        .all()
        .iter()
        .all(|p| p.duplicate_status == DuplicateStatus::Unique));
}
