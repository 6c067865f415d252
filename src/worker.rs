//! Duplicate-check worker.
//!
//! The job handler is the plain function [`check_duplicate`]. [`Worker`]
//! owns everything around it: claiming jobs, the per-job timeout, and the
//! retry/backoff policy that decides between redelivery and dead-lettering.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::db::{PhotoRepository, RepoError};
use crate::models::job::{Job, JobEnvelope, Verdict};
use crate::services::detector::{DetectError, DuplicateDetector};
use crate::services::queue::{JobQueue, QueueError, StalledSweep};
use crate::services::retry::{RetryDecision, RetryPolicy};
use crate::services::upload::reconcile_deferred_checks;

/// Photos re-enqueued per reconciliation pass.
const RECONCILE_BATCH: i64 = 100;

/// Register help text for every metric the worker process emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "duplicate_check_jobs_completed_total",
        "Duplicate checks that finished with a verdict"
    );
    metrics::describe_counter!(
        "duplicate_check_jobs_retried_total",
        "Duplicate-check deliveries scheduled for another attempt"
    );
    metrics::describe_counter!(
        "duplicate_check_jobs_dead_lettered_total",
        "Duplicate-check jobs moved to the dead-letter list"
    );
    metrics::describe_counter!(
        "duplicate_check_jobs_enqueued_total",
        "Duplicate-check jobs enqueued"
    );
    metrics::describe_histogram!(
        "duplicate_check_processing_seconds",
        metrics::Unit::Seconds,
        "Time spent on one duplicate-check delivery"
    );
    metrics::describe_gauge!(
        "duplicate_check_queue_depth",
        "Duplicate-check jobs per queue state"
    );
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub retry: RetryPolicy,
    /// Upper bound for one duplicate check.
    pub job_timeout: Duration,
    /// How long a single dequeue blocks waiting for work.
    pub poll_wait: Duration,
    /// Pause after a queue error before claiming again.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(30),
            poll_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Verdict),
    /// The photo was deleted before its check ran; nothing to record.
    Skipped,
    Retrying { delay: Duration },
    DeadLettered,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error("Photo store error: {0}")]
    Repo(#[from] RepoError),

    #[error("Duplicate check timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Run the duplicate check for one envelope and record the verdict on the
/// photo. Returns `None` when the photo no longer exists.
pub async fn check_duplicate(
    detector: &dyn DuplicateDetector,
    photos: &dyn PhotoRepository,
    envelope: &JobEnvelope,
) -> Result<Option<Verdict>, JobError> {
    if photos.find_photo_by_id(envelope.photo_id).await?.is_none() {
        return Ok(None);
    }

    let verdict = detector.check(envelope).await?;

    if !photos
        .update_duplicate_status(envelope.photo_id, verdict.into())
        .await?
    {
        return Ok(None);
    }
    Ok(Some(verdict))
}

pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    detector: Arc<dyn DuplicateDetector>,
    photos: Arc<dyn PhotoRepository>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        detector: Arc<dyn DuplicateDetector>,
        photos: Arc<dyn PhotoRepository>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            detector,
            photos,
            config,
        }
    }

    /// Claim and process at most one job. `Ok(None)` means the queue stayed
    /// empty for the whole poll window.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, WorkerError> {
        match self.queue.dequeue(self.config.poll_wait).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process a job this worker has already claimed.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, WorkerError> {
        tracing::info!(
            worker = %self.id,
            job_id = %job.id,
            photo_id = %job.envelope.photo_id,
            attempt = job.attempt,
            "Processing duplicate check"
        );

        let start = Instant::now();
        let result = tokio::time::timeout(
            self.config.job_timeout,
            check_duplicate(&*self.detector, &*self.photos, &job.envelope),
        )
        .await
        .unwrap_or(Err(JobError::Timeout(self.config.job_timeout)));
        metrics::histogram!("duplicate_check_processing_seconds")
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(checked) => {
                self.queue.complete(&job).await?;
                metrics::counter!("duplicate_check_jobs_completed_total").increment(1);

                match checked {
                    Some(verdict) => {
                        tracing::info!(
                            worker = %self.id,
                            job_id = %job.id,
                            photo_id = %job.envelope.photo_id,
                            ?verdict,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Duplicate check complete"
                        );
                        Ok(JobOutcome::Completed(verdict))
                    }
                    None => {
                        tracing::info!(
                            worker = %self.id,
                            job_id = %job.id,
                            photo_id = %job.envelope.photo_id,
                            "Photo deleted before its duplicate check, skipping"
                        );
                        Ok(JobOutcome::Skipped)
                    }
                }
            }
            Err(e) => self.fail(&job, &e).await,
        }
    }

    async fn fail(&self, job: &Job, error: &JobError) -> Result<JobOutcome, WorkerError> {
        let reason = error.to_string();
        let decision = self.config.retry.decide(job.attempt, &mut rand::thread_rng());

        match decision {
            RetryDecision::Retry { delay } => {
                self.queue.retry(job, &reason, delay).await?;
                metrics::counter!("duplicate_check_jobs_retried_total").increment(1);
                tracing::warn!(
                    worker = %self.id,
                    job_id = %job.id,
                    photo_id = %job.envelope.photo_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Duplicate check failed, retrying"
                );
                Ok(JobOutcome::Retrying { delay })
            }
            RetryDecision::DeadLetter => {
                self.queue.dead_letter(job, &reason).await?;
                metrics::counter!("duplicate_check_jobs_dead_lettered_total").increment(1);
                tracing::error!(
                    worker = %self.id,
                    job_id = %job.id,
                    photo_id = %job.envelope.photo_id,
                    attempts = job.attempt + 1,
                    error = %reason,
                    "Duplicate check failed permanently, job dead-lettered"
                );
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    /// Claim and process jobs until `shutdown` flips to `true`. A job already
    /// claimed is always finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.id, topic = %self.queue.topic(), "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.queue.dequeue(self.config.poll_wait) => claimed,
            };

            let result = match claimed {
                Ok(Some(job)) => self.process(job).await.map(|_| ()),
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                tracing::error!(worker = %self.id, error = %e, "Queue error, backing off");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                }
            }
        }

        tracing::info!(worker = %self.id, "Worker stopped");
    }
}

/// Reclaim expired leases, logging every job that ran out of attempts.
pub async fn sweep_stalled(
    queue: &dyn JobQueue,
    max_attempts: u32,
) -> Result<StalledSweep, QueueError> {
    let sweep = queue.requeue_stalled(max_attempts).await?;

    if sweep.requeued > 0 {
        metrics::counter!("duplicate_check_jobs_retried_total").increment(sweep.requeued as u64);
        tracing::warn!(requeued = sweep.requeued, "Requeued jobs with expired leases");
    }
    for job in &sweep.dead_lettered {
        metrics::counter!("duplicate_check_jobs_dead_lettered_total").increment(1);
        tracing::error!(
            job_id = %job.id,
            photo_id = %job.envelope.photo_id,
            attempts = job.attempt,
            error = job.last_error.as_deref().unwrap_or_default(),
            "Stalled duplicate check dead-lettered"
        );
    }

    Ok(sweep)
}

/// One maintenance pass: stalled-lease sweep, deferred-check reconciliation
/// and the queue depth gauge. Failures are logged and never abort the pass.
pub async fn maintenance_tick(queue: &dyn JobQueue, photos: &dyn PhotoRepository, max_attempts: u32) {
    if let Err(e) = sweep_stalled(queue, max_attempts).await {
        tracing::warn!(error = %e, "Stalled-lease sweep failed");
    }

    match reconcile_deferred_checks(photos, queue, RECONCILE_BATCH).await {
        Ok(0) => {}
        Ok(enqueued) => tracing::info!(enqueued, "Reconciled deferred duplicate checks"),
        Err(e) => tracing::warn!(error = %e, "Deferred check reconciliation failed"),
    }

    match queue.depth().await {
        Ok(depth) => {
            metrics::gauge!("duplicate_check_queue_depth", "state" => "waiting")
                .set(depth.waiting as f64);
            metrics::gauge!("duplicate_check_queue_depth", "state" => "active")
                .set(depth.active as f64);
            metrics::gauge!("duplicate_check_queue_depth", "state" => "delayed")
                .set(depth.delayed as f64);
            metrics::gauge!("duplicate_check_queue_depth", "state" => "dead")
                .set(depth.dead as f64);
        }
        Err(e) => tracing::debug!(error = %e, "Queue depth unavailable"),
    }
}

/// Run [`maintenance_tick`] every `interval` until shutdown.
pub async fn run_maintenance(
    queue: Arc<dyn JobQueue>,
    photos: Arc<dyn PhotoRepository>,
    max_attempts: u32,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => maintenance_tick(&*queue, &*photos, max_attempts).await,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}
