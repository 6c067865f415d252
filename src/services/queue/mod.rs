//! Duplicate-check job queue.
//!
//! The upload path enqueues one [`JobEnvelope`] per stored photo; workers
//! claim jobs with [`JobQueue::dequeue`] and must report every claimed job
//! back through `complete`, `retry` or `dead_letter`. A claimed job that is
//! never reported is handed out again once its visibility lease expires
//! (see [`JobQueue::requeue_stalled`]), so delivery is at-least-once.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::models::job::{Job, JobEnvelope, JobId};

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

/// Topic shared by the upload path and the duplicate-check worker.
pub const DUPLICATE_CHECK_TOPIC: &str = "duplicateCheckQueue";

/// How long completed job records are kept for inspection.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Error recorded on a job whose lease ran out before it was acknowledged.
pub const LEASE_EXPIRED: &str = "visibility lease expired before acknowledgement";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub dead: u64,
}

/// Result of a stalled-lease sweep.
#[derive(Debug, Default)]
pub struct StalledSweep {
    pub requeued: usize,
    pub dead_lettered: Vec<Job>,
}

/// Competing-consumer queue bound to a single topic.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn topic(&self) -> &str;

    /// Persist an envelope and return its id without waiting for processing.
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError>;

    /// Claim the next job, suspending for at most `wait`. A claimed job is
    /// invisible to other consumers until it is reported or its lease expires.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError>;

    /// Acknowledge success; the job leaves the pending set for good.
    ///
    /// `complete`, `retry` and `dead_letter` only act while `job` is the
    /// delivery that holds the lease (same id and attempt). A report from a
    /// consumer whose lease was reclaimed is ignored.
    async fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Report a failure and make the job visible again after `delay`.
    async fn retry(&self, job: &Job, error: &str, delay: Duration) -> Result<(), QueueError>;

    /// Report a final failure; the job moves to the dead-letter list.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    /// Reclaim jobs whose lease expired. Each reclaim counts as a failed
    /// attempt; jobs reaching `max_attempts` are dead-lettered.
    async fn requeue_stalled(&self, max_attempts: u32) -> Result<StalledSweep, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    NotFound(JobId),
}
