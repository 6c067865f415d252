use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Direction, Script};
use std::time::Duration;

use super::{
    JobQueue, QueueDepth, QueueError, StalledSweep, COMPLETED_RETENTION, LEASE_EXPIRED,
};
use crate::models::job::{Job, JobEnvelope, JobId, JobState};

const KEY_PREFIX: &str = "photo_dedup";

/// Moves every delayed job whose ready time has passed onto the waiting list.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return #due
"#;

/// Acknowledges a job only while the reporting delivery still holds it: the
/// id must be active and the stored attempt must match the delivery's. A late
/// ack from a consumer whose lease was reclaimed leaves the newer claim alone.
const COMPLETE_ACTIVE_SCRIPT: &str = r#"
local stored = redis.call('GET', KEYS[3])
if not stored or cjson.decode(stored).attempt ~= tonumber(ARGV[4]) then
    return 0
end
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2], 'EX', ARGV[3])
return removed
"#;

/// Takes a job out of the active list and files it elsewhere, under the same
/// ownership check as [`COMPLETE_ACTIVE_SCRIPT`]. Returns 1 when the move
/// happened.
const RELEASE_SCRIPT: &str = r#"
local stored = redis.call('GET', KEYS[3])
if not stored or cjson.decode(stored).attempt ~= tonumber(ARGV[5]) then
    return 0
end
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
if ARGV[3] == 'zset' then
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
else
    redis.call('LPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

/// Where a released job goes next.
enum Release {
    Waiting,
    /// Delayed set, visible again at the given unix millis.
    Delayed(i64),
    Dead,
}

struct QueueKeys {
    sequence: String,
    waiting: String,
    active: String,
    delayed: String,
    leases: String,
    dead: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(topic: &str) -> Self {
        let base = format!("{KEY_PREFIX}:{topic}");
        Self {
            sequence: format!("{base}:id"),
            waiting: format!("{base}:waiting"),
            active: format!("{base}:active"),
            delayed: format!("{base}:delayed"),
            leases: format!("{base}:leases"),
            dead: format!("{base}:dead"),
            job_prefix: format!("{base}:job"),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:{}", self.job_prefix, id)
    }
}

/// Redis-backed durable queue.
///
/// Waiting jobs form a list consumed from the tail with `BLMOVE` into the
/// active list, so a claim is atomic across consumers and the worker blocks
/// server-side instead of polling. Each active job carries a lease in a
/// sorted set scored by its visibility deadline.
pub struct RedisQueue {
    client: redis::Client,
    topic: String,
    keys: QueueKeys,
    visibility_timeout: Duration,
    promote_due: Script,
    complete_active: Script,
    release: Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        topic: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            topic: topic.to_string(),
            keys: QueueKeys::new(topic),
            visibility_timeout,
            promote_due: Script::new(PROMOTE_DUE_SCRIPT),
            complete_active: Script::new(COMPLETE_ACTIVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        id: JobId,
    ) -> Result<Option<Job>, QueueError> {
        let payload: Option<String> = conn.get(self.keys.job(id)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn lease_deadline_ms(&self) -> i64 {
        let visibility = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        now_ms().saturating_add(visibility)
    }

    /// Write `job` back and move it to `to`, provided the delivery at
    /// `claimed_attempt` still holds the lease.
    async fn release(
        &self,
        conn: &mut MultiplexedConnection,
        job: &Job,
        claimed_attempt: u32,
        to: Release,
    ) -> Result<bool, QueueError> {
        let payload = serde_json::to_string(job)?;
        let (target, mode, score) = match to {
            Release::Waiting => (&self.keys.waiting, "list", 0),
            Release::Delayed(ready_at) => (&self.keys.delayed, "zset", ready_at),
            Release::Dead => (&self.keys.dead, "list", 0),
        };

        let moved: i64 = self
            .release
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(self.keys.job(job.id))
            .key(target)
            .arg(job.id.0)
            .arg(&payload)
            .arg(mode)
            .arg(score)
            .arg(claimed_attempt)
            .invoke_async(conn)
            .await?;

        if moved == 0 {
            tracing::warn!(
                job_id = %job.id,
                attempt = claimed_attempt,
                "Job is no longer held by this delivery, release skipped"
            );
        }
        Ok(moved == 1)
    }

    /// Record the failure on a copy of `job` ready to be written back.
    fn failed_copy(job: &Job, error: &str, state: JobState) -> Job {
        let mut next = job.clone();
        next.state = state;
        next.attempt = job.attempt.saturating_add(1);
        next.last_error = Some(error.to_string());
        next.updated_at = Utc::now();
        next
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, QueueError> {
        let mut conn = self.connection().await?;
        let id: u64 = conn.incr(&self.keys.sequence, 1).await?;
        let job = Job::new(JobId(id), envelope);
        let payload = serde_json::to_string(&job)?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(job.id), &payload)
            .ignore()
            .lpush(&self.keys.waiting, id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(job.id)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection().await?;

        let promoted: usize = self
            .promote_due
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            tracing::debug!(topic = %self.topic, promoted, "Promoted delayed jobs");
        }

        // A zero timeout would block forever.
        let timeout = wait.as_secs_f64().max(0.01);
        let claimed: Option<u64> = conn
            .blmove(
                &self.keys.waiting,
                &self.keys.active,
                Direction::Right,
                Direction::Left,
                timeout,
            )
            .await?;

        let Some(id) = claimed.map(JobId) else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&mut conn, id).await? else {
            tracing::warn!(job_id = %id, "Claimed job has no record, dropping it");
            let _: () = conn.lrem(&self.keys.active, 1, id.0).await?;
            return Ok(None);
        };

        job.state = JobState::Active;
        job.updated_at = Utc::now();
        let payload = serde_json::to_string(&job)?;

        let _: () = redis::pipe()
            .atomic()
            .zadd(&self.keys.leases, id.0, self.lease_deadline_ms())
            .ignore()
            .set(self.keys.job(id), &payload)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let mut done = job.clone();
        done.state = JobState::Completed;
        done.updated_at = Utc::now();
        let payload = serde_json::to_string(&done)?;

        let removed: i64 = self
            .complete_active
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(self.keys.job(job.id))
            .arg(job.id.0)
            .arg(&payload)
            .arg(COMPLETED_RETENTION.as_secs())
            .arg(job.attempt)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempt,
                "Job lease expired before completion; a redelivered copy may run again"
            );
        }
        Ok(())
    }

    async fn retry(&self, job: &Job, error: &str, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let next = Self::failed_copy(job, error, JobState::Waiting);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let ready_at = now_ms().saturating_add(delay_ms);
        self.release(&mut conn, &next, job.attempt, Release::Delayed(ready_at))
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let next = Self::failed_copy(job, error, JobState::Failed);
        self.release(&mut conn, &next, job.attempt, Release::Dead).await?;
        Ok(())
    }

    async fn requeue_stalled(&self, max_attempts: u32) -> Result<StalledSweep, QueueError> {
        let mut conn = self.connection().await?;
        let mut sweep = StalledSweep::default();

        // A consumer that died between BLMOVE and writing its lease leaves an
        // active id without one; give it a lease so it expires normally.
        let active: Vec<u64> = conn.lrange(&self.keys.active, 0, -1).await?;
        for id in active {
            let _: i64 = redis::cmd("ZADD")
                .arg(&self.keys.leases)
                .arg("NX")
                .arg(self.lease_deadline_ms())
                .arg(id)
                .query_async(&mut conn)
                .await?;
        }

        let expired: Vec<u64> = conn
            .zrangebyscore(&self.keys.leases, "-inf", now_ms())
            .await?;

        for id in expired.into_iter().map(JobId) {
            let Some(job) = self.load(&mut conn, id).await? else {
                let _: () = conn.zrem(&self.keys.leases, id.0).await?;
                continue;
            };

            let exhausted = job.attempt.saturating_add(1) >= max_attempts;
            let (next, to) = if exhausted {
                (Self::failed_copy(&job, LEASE_EXPIRED, JobState::Failed), Release::Dead)
            } else {
                (Self::failed_copy(&job, LEASE_EXPIRED, JobState::Waiting), Release::Waiting)
            };

            if !self.release(&mut conn, &next, job.attempt, to).await? {
                // Either a stale lease left behind by a job that already moved
                // on, or the job changed hands since it was loaded. In the
                // latter case the next sweep gives the new claim a lease.
                let _: () = conn.zrem(&self.keys.leases, id.0).await?;
            } else if exhausted {
                sweep.dead_lettered.push(next);
            } else {
                sweep.requeued += 1;
            }
        }

        Ok(sweep)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection().await?;
        self.load(&mut conn, id).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let (waiting, active, delayed, dead): (u64, u64, u64, u64) = redis::pipe()
            .llen(&self.keys.waiting)
            .llen(&self.keys.active)
            .zcard(&self.keys.delayed)
            .llen(&self.keys.dead)
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth {
            waiting,
            active,
            delayed,
            dead,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
