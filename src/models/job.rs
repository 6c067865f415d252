use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned by the queue, monotonically increasing within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable description of one duplicate-check task.
///
/// Only ever built by the upload path after the referenced photo record has
/// been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub photo_id: Uuid,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(photo_id: Uuid, url: impl Into<String>) -> Self {
        Self {
            photo_id,
            url: url.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Lifecycle of a job inside the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    /// Retry budget exhausted; the job sits in the dead-letter list.
    Failed,
}

/// A queued envelope plus the queue's bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub envelope: JobEnvelope,
    pub state: JobState,
    /// Number of failed deliveries so far. Zero on first delivery.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, envelope: JobEnvelope) -> Self {
        Self {
            id,
            envelope,
            state: JobState::Waiting,
            attempt: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of the duplicate-check algorithm for one photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "photoId", rename_all = "snake_case")]
pub enum Verdict {
    Unique,
    DuplicateOf(Uuid),
}
