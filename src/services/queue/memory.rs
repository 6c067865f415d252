use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    JobQueue, QueueDepth, QueueError, StalledSweep, COMPLETED_RETENTION, LEASE_EXPIRED,
};
use crate::models::job::{Job, JobEnvelope, JobId, JobState};

/// Process-local queue with the same delivery semantics as [`super::RedisQueue`].
///
/// Nothing survives a restart, so it only suits tests and single-process
/// development. Availability can be switched off to exercise the upload
/// path's degraded mode. Completed records are dropped once they are older
/// than the retention window.
pub struct MemoryQueue {
    topic: String,
    visibility_timeout: Duration,
    retention: Duration,
    state: Mutex<MemoryState>,
    notify: Notify,
}

struct MemoryState {
    available: bool,
    next_id: u64,
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    /// Active job id -> lease deadline.
    active: HashMap<JobId, Instant>,
    delayed: Vec<(Instant, JobId)>,
    dead: Vec<JobId>,
    /// Completion time -> job id, oldest first.
    completed: VecDeque<(Instant, JobId)>,
}

impl MemoryQueue {
    pub fn new(topic: &str, visibility_timeout: Duration) -> Self {
        Self {
            topic: topic.to_string(),
            visibility_timeout,
            retention: COMPLETED_RETENTION,
            state: Mutex::new(MemoryState {
                available: true,
                next_id: 0,
                jobs: HashMap::new(),
                waiting: VecDeque::new(),
                active: HashMap::new(),
                delayed: Vec::new(),
                dead: Vec::new(),
                completed: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Override how long completed records are kept.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Simulate the backing store going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Dead-lettered jobs, oldest first.
    pub fn dead_letters(&self) -> Vec<Job> {
        let state = self.lock();
        state
            .dead
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Every job still on record, in id order.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, MemoryState>, QueueError> {
        let state = self.lock();
        if state.available {
            Ok(state)
        } else {
            Err(QueueError::Unavailable(format!(
                "in-memory queue '{}' is switched off",
                self.topic
            )))
        }
    }

    /// Promote due retries, then claim the oldest waiting job.
    /// Returns the claimed job or the earliest pending retry time.
    fn try_claim(&self) -> Result<Result<Job, Option<Instant>>, QueueError> {
        let mut state = self.checked()?;
        let now = Instant::now();

        let (due, pending): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(ready, _)| *ready <= now);
        state.delayed = pending;
        state.waiting.extend(due.into_iter().map(|(_, id)| id));

        while let Some(id) = state.waiting.pop_front() {
            let deadline = now + self.visibility_timeout;
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Active;
            job.updated_at = Utc::now();
            let claimed = job.clone();
            state.active.insert(id, deadline);
            return Ok(Ok(claimed));
        }

        Ok(Err(state.delayed.iter().map(|(ready, _)| *ready).min()))
    }

    fn prune_completed(&self, state: &mut MemoryState, now: Instant) {
        while let Some(&(done_at, id)) = state.completed.front() {
            if now.saturating_duration_since(done_at) < self.retention {
                break;
            }
            state.completed.pop_front();
            state.jobs.remove(&id);
        }
    }

    /// Whether `job` is the delivery currently holding the lease. A copy
    /// from an earlier delivery carries a lower attempt than the record.
    fn holds_lease(state: &MemoryState, job: &Job) -> bool {
        state.active.contains_key(&job.id)
            && state
                .jobs
                .get(&job.id)
                .is_some_and(|stored| stored.attempt == job.attempt)
    }

    /// Remove `job` from the active set and store a failed copy.
    /// Returns `None` unless `job` still holds the lease.
    fn release_failed(
        state: &mut MemoryState,
        job: &Job,
        error: &str,
        next_state: JobState,
    ) -> Option<Job> {
        if !Self::holds_lease(state, job) {
            return None;
        }
        state.active.remove(&job.id);
        let stored = state.jobs.get_mut(&job.id)?;
        stored.state = next_state;
        stored.attempt = job.attempt.saturating_add(1);
        stored.last_error = Some(error.to_string());
        stored.updated_at = Utc::now();
        Some(stored.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError> {
        let id = {
            let mut state = self.checked()?;
            self.prune_completed(&mut state, Instant::now());
            state.next_id += 1;
            let id = JobId(state.next_id);
            state.jobs.insert(id, Job::new(id, envelope));
            state.waiting.push_back(id);
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let give_up_at = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = match self.try_claim()? {
                Ok(job) => return Ok(Some(job)),
                Err(next_ready) => next_ready,
            };

            if Instant::now() >= give_up_at {
                return Ok(None);
            }
            let wake_at = next_ready.map_or(give_up_at, |ready| ready.min(give_up_at));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.checked()?;
        if !Self::holds_lease(&state, job) {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempt,
                "Job lease expired before completion; a redelivered copy may run again"
            );
            return Ok(());
        }
        state.active.remove(&job.id);
        let stored = state.jobs.get_mut(&job.id).ok_or(QueueError::NotFound(job.id))?;
        stored.state = JobState::Completed;
        stored.updated_at = Utc::now();

        let now = Instant::now();
        state.completed.push_back((now, job.id));
        self.prune_completed(&mut state, now);
        Ok(())
    }

    async fn retry(&self, job: &Job, error: &str, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.checked()?;
            if Self::release_failed(&mut state, job, error, JobState::Waiting).is_some() {
                state.delayed.push((Instant::now() + delay, job.id));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut state = self.checked()?;
        if Self::release_failed(&mut state, job, error, JobState::Failed).is_some() {
            state.dead.push(job.id);
        }
        Ok(())
    }

    async fn requeue_stalled(&self, max_attempts: u32) -> Result<StalledSweep, QueueError> {
        let mut sweep = StalledSweep::default();
        {
            let mut state = self.checked()?;
            let now = Instant::now();
            let mut expired: Vec<JobId> = state
                .active
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            expired.sort();

            for id in expired {
                let Some(job) = state.jobs.get(&id).cloned() else {
                    state.active.remove(&id);
                    continue;
                };
                if job.attempt.saturating_add(1) >= max_attempts {
                    if let Some(dead) =
                        Self::release_failed(&mut state, &job, LEASE_EXPIRED, JobState::Failed)
                    {
                        state.dead.push(id);
                        sweep.dead_lettered.push(dead);
                    }
                } else if Self::release_failed(&mut state, &job, LEASE_EXPIRED, JobState::Waiting)
                    .is_some()
                {
                    state.waiting.push_back(id);
                    sweep.requeued += 1;
                }
            }
        }
        if sweep.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(sweep)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.checked()?.jobs.get(&id).cloned())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.checked()?;
        Ok(QueueDepth {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            dead: state.dead.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.checked().map(|_| ())
    }
}
