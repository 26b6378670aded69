//! In-process job backend
//!
//! Jobs live in a map keyed by id; each channel keeps a min-heap of queue
//! keys so the oldest ready job is leased first. Heap entries are discarded
//! lazily once the job they point at is no longer pending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::{BackendKind, JobBackend};
use crate::errors::QueueResult;
use crate::job_scheduling::types::{
    Job, JobCompletion, JobFilter, JobId, JobState, Schedule, ScheduleStatus,
};

type QueueKey = (DateTime<Utc>, DateTime<Utc>, JobId);

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    pending: HashMap<String, BinaryHeap<Reverse<QueueKey>>>,
    schedules: BTreeMap<String, Schedule>,
}

impl MemoryState {
    /// Lease the first ready job, or report when the next one becomes ready
    fn take_ready(
        &mut self,
        channels: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, Option<DateTime<Utc>>> {
        let MemoryState { jobs, pending, .. } = self;
        let mut next_ready: Option<DateTime<Utc>> = None;

        for channel in channels {
            let Some(heap) = pending.get_mut(channel) else {
                continue;
            };
            while let Some(Reverse((ready_at, _, id))) = heap.peek().copied() {
                let Some(job) = jobs.get_mut(&id).filter(|j| j.state == JobState::Pending) else {
                    heap.pop();
                    continue;
                };
                if ready_at > now {
                    next_ready = Some(next_ready.map_or(ready_at, |t| t.min(ready_at)));
                    break;
                }
                heap.pop();
                job.mark_running(worker_id, now);
                return Ok(job.clone());
            }
        }
        Err(next_ready)
    }

    fn insert_job(&mut self, job: Job) {
        if job.state == JobState::Pending {
            self.pending
                .entry(job.channel.clone())
                .or_default()
                .push(Reverse(job.queue_key()));
        }
        debug!("Enqueued job {} on channel '{}'", job.id, job.channel);
        self.jobs.insert(job.id, job);
    }
}

/// Job backend held entirely in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    /// Wakes leasers when a job is enqueued
    notify: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held, in any state
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        self.state.write().await.insert_job(job);
        self.notify.notify_waiters();
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
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut state = self.state.write().await;
                match state.take_ready(channels, worker_id, Utc::now()) {
                    Ok(job) => return Ok(Some(job)),
                    Err(next_ready) => next_ready,
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = next_ready
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(remaining, |until_ready| until_ready.min(remaining));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn record_attempt(&self, id: JobId, attempt: u32) -> QueueResult<()> {
        if let Some(job) = self.state.write().await.jobs.get_mut(&id) {
            job.attempts = attempt;
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, outcome: JobCompletion) -> QueueResult<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Running => {
                job.finish(&outcome, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Pending jobs are cancelled outright. A running job is marked cancelled
    /// and its eventual completion is discarded; the run function itself is
    /// not interrupted.
    async fn cancel_job(&self, id: JobId) -> QueueResult<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if !job.state.is_terminal() => {
                job.mark_cancelled(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_job(&self, id: JobId) -> QueueResult<bool> {
        Ok(self.state.write().await.jobs.remove(&id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.expires_at.is_some_and(|at| at <= now))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn insert_schedule(&self, schedule: &Schedule, replace: bool) -> QueueResult<bool> {
        let mut state = self.state.write().await;
        if !replace && state.schedules.contains_key(&schedule.id) {
            return Ok(false);
        }
        state.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(true)
    }

    async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>> {
        Ok(self.state.read().await.schedules.get(id).cloned())
    }

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>> {
        Ok(self.state.read().await.schedules.values().cloned().collect())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> QueueResult<bool> {
        let mut state = self.state.write().await;
        match state.schedules.get_mut(&schedule.id) {
            Some(stored) => {
                *stored = schedule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fire_schedule(
        &self,
        schedule: &Schedule,
        expected: DateTime<Utc>,
        job: Job,
    ) -> QueueResult<bool> {
        {
            let mut state = self.state.write().await;
            let due = state.schedules.get(&schedule.id).is_some_and(|stored| {
                stored.status == ScheduleStatus::Active && stored.next_fire_time == Some(expected)
            });
            if !due {
                return Ok(false);
            }
            state.insert_job(job);
            state.schedules.insert(schedule.id.clone(), schedule.clone());
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn delete_schedule(&self, id: &str) -> QueueResult<bool> {
        Ok(self.state.write().await.schedules.remove(id).is_some())
    }
}
