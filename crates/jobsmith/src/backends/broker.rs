//! Redis job backend
//!
//! Layout, every key prefixed with `jobsmith:`:
//! - `job:{id}` JSON document; terminal jobs carry a native expiry of `result_ttl`
//! - `queue:{channel}` list of ready job ids, pushed on the left, popped on the right
//! - `delayed` sorted set of job ids scored by ready time in milliseconds
//! - `jobs` set indexing every known job id
//! - `schedules` hash of schedule id to JSON document
//! - `fire:{schedule}:{timestamp}` short-lived lock claiming one firing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BackendKind, JobBackend};
use crate::errors::{QueueError, QueueResult};
use crate::job_scheduling::types::{
    Job, JobCompletion, JobFilter, JobId, JobState, Schedule, ScheduleStatus,
};

const KEY_PREFIX: &str = "jobsmith";
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FIRE_LOCK_SECONDS: u64 = 3600;

fn job_key(id: JobId) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

fn queue_key(channel: &str) -> String {
    format!("{KEY_PREFIX}:queue:{channel}")
}

fn delayed_key() -> String {
    format!("{KEY_PREFIX}:delayed")
}

fn index_key() -> String {
    format!("{KEY_PREFIX}:jobs")
}

fn schedules_key() -> String {
    format!("{KEY_PREFIX}:schedules")
}

fn fire_lock_key(schedule_id: &str, expected: DateTime<Utc>) -> String {
    format!("{KEY_PREFIX}:fire:{schedule_id}:{}", expected.timestamp_millis())
}

/// Job backend on a Redis multiplexed connection
#[derive(Clone)]
pub struct BrokerBackend {
    conn: MultiplexedConnection,
}

impl BrokerBackend {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    async fn load(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn save(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        match job.expires_at {
            Some(expires_at) => {
                let ttl = (expires_at - Utc::now()).num_seconds().max(1) as u64;
                let _: () = conn.set_ex(job_key(job.id), json, ttl).await?;
            }
            None => {
                let _: () = conn.set(job_key(job.id), json).await?;
            }
        }
        Ok(())
    }

    /// Move delayed jobs whose time has come onto their channel lists
    async fn promote_due(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(delayed_key(), "-inf", now_ms).await?;
        for raw_id in due {
            // Only the caller that removes the entry promotes it
            let removed: usize = conn.zrem(delayed_key(), &raw_id).await?;
            if removed == 0 {
                continue;
            }
            let Ok(id) = raw_id.parse::<JobId>() else {
                warn!("Dropping malformed delayed job id '{}'", raw_id);
                continue;
            };
            if let Some(job) = self.load(id).await? {
                let _: usize = conn.lpush(queue_key(&job.channel), &raw_id).await?;
            }
        }
        Ok(())
    }

    async fn try_lease(&self, channels: &[String], worker_id: &str) -> QueueResult<Option<Job>> {
        self.promote_due().await?;
        let mut conn = self.conn.clone();
        for channel in channels {
            loop {
                let popped: Option<String> = conn.rpop(queue_key(channel), None).await?;
                let Some(raw_id) = popped else {
                    break;
                };
                let Ok(id) = raw_id.parse::<JobId>() else {
                    warn!("Dropping malformed queued job id '{}'", raw_id);
                    continue;
                };
                match self.load(id).await? {
                    Some(mut job) if job.state == JobState::Pending => {
                        job.mark_running(worker_id, Utc::now());
                        self.save(&job).await?;
                        return Ok(Some(job));
                    }
                    _ => debug!("Skipping stale queue entry {}", id),
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobBackend for BrokerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        self.save(&job).await?;
        let mut conn = self.conn.clone();
        let id = job.id.to_string();
        let _: usize = conn.sadd(index_key(), &id).await?;
        if job.state != JobState::Pending {
            return Ok(());
        }
        if job.is_ready(Utc::now()) {
            let _: usize = conn.lpush(queue_key(&job.channel), &id).await?;
        } else {
            let _: usize = conn
                .zadd(delayed_key(), &id, job.ready_at().timestamp_millis())
                .await?;
        }
        debug!("Enqueued job {} on channel '{}'", job.id, job.channel);
        Ok(())
    }

    async fn lease(
        &self,
        channels: &[String],
        worker_id: &str,
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_lease(channels, worker_id).await? {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(LEASE_POLL_INTERVAL)).await;
        }
    }

    async fn record_attempt(&self, id: JobId, attempt: u32) -> QueueResult<()> {
        if let Some(mut job) = self.load(id).await? {
            job.attempts = attempt;
            self.save(&job).await?;
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, outcome: JobCompletion) -> QueueResult<bool> {
        match self.load(id).await? {
            Some(mut job) if job.state == JobState::Running => {
                job.finish(&outcome, Utc::now());
                self.save(&job).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.load(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(index_key()).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            if let Some(job) = self.load(id).await?
                && filter.matches(&job)
            {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|job| (job.created_at, job.id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Only jobs still sitting in a queue list or the delayed set can be cancelled
    async fn cancel_job(&self, id: JobId) -> QueueResult<bool> {
        let Some(mut job) = self.load(id).await? else {
            return Ok(false);
        };
        match job.state {
            JobState::Pending => {
                let mut conn = self.conn.clone();
                let raw_id = id.to_string();
                let from_queue: usize = conn.lrem(queue_key(&job.channel), 0, &raw_id).await?;
                let from_delayed: usize = conn.zrem(delayed_key(), &raw_id).await?;
                if from_queue + from_delayed == 0 {
                    // A worker popped it between our read and the removal
                    return Err(QueueError::unsupported("cancel running job", "redis"));
                }
                job.mark_cancelled(Utc::now());
                self.save(&job).await?;
                Ok(true)
            }
            JobState::Running => Err(QueueError::unsupported("cancel running job", "redis")),
            _ => Ok(false),
        }
    }

    async fn delete_job(&self, id: JobId) -> QueueResult<bool> {
        let Some(job) = self.load(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let raw_id = id.to_string();
        let _: usize = conn.lrem(queue_key(&job.channel), 0, &raw_id).await?;
        let _: usize = conn.zrem(delayed_key(), &raw_id).await?;
        let _: usize = conn.srem(index_key(), &raw_id).await?;
        let removed: usize = conn.del(job_key(id)).await?;
        Ok(removed > 0)
    }

    /// Job documents expire natively; this drops index entries left behind
    async fn purge_expired(&self, _now: DateTime<Utc>) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(index_key()).await?;
        let mut purged = 0;
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            let exists: bool = conn.exists(job_key(id)).await?;
            if !exists {
                let _: usize = conn.srem(index_key(), &raw_id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn insert_schedule(&self, schedule: &Schedule, replace: bool) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(schedule)?;
        if replace {
            let _: usize = conn.hset(schedules_key(), &schedule.id, json).await?;
            return Ok(true);
        }
        let inserted: bool = conn.hset_nx(schedules_key(), &schedule.id, json).await?;
        Ok(inserted)
    }

    async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(schedules_key(), id).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(schedules_key()).await?;
        let mut schedules = raw
            .iter()
            .map(|json| serde_json::from_str::<Schedule>(json))
            .collect::<Result<Vec<_>, _>>()?;
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: &Schedule) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(schedules_key(), &schedule.id).await?;
        if !exists {
            return Ok(false);
        }
        let json = serde_json::to_string(schedule)?;
        let _: usize = conn.hset(schedules_key(), &schedule.id, json).await?;
        Ok(true)
    }

    /// The fire lock is released again when the job cannot be enqueued
    async fn fire_schedule(
        &self,
        schedule: &Schedule,
        expected: DateTime<Utc>,
        job: Job,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let lock = fire_lock_key(&schedule.id, expected);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lock)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(FIRE_LOCK_SECONDS)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            return Ok(false);
        }
        let due = self.get_schedule(&schedule.id).await?.is_some_and(|stored| {
            stored.status == ScheduleStatus::Active && stored.next_fire_time == Some(expected)
        });
        if !due {
            return Ok(false);
        }
        if let Err(e) = self.enqueue(job).await {
            let released: redis::RedisResult<usize> = conn.del(&lock).await;
            if let Err(release_err) = released {
                warn!("Failed to release fire lock {}: {}", lock, release_err);
            }
            return Err(e);
        }
        self.update_schedule(schedule).await
    }

    async fn delete_schedule(&self, id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.hdel(schedules_key(), id).await?;
        Ok(removed > 0)
    }
}
