//! Job backend over the relational tables
//!
//! Leases and cancellations are conditional updates guarded on the job's
//! current state, so concurrent workers on any number of hosts never share a
//! job: whichever update affects the row wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Database;
use crate::backends::{BackendKind, JobBackend};
use crate::entities::prelude::*;
use crate::entities::{jobs, schedules};
use crate::errors::{QueueError, QueueResult};
use crate::job_scheduling::types::{
    Job, JobCompletion, JobFilter, JobId, JobState, Schedule, ScheduleStatus,
};

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Candidates examined per channel on each lease attempt
const LEASE_BATCH: u64 = 8;

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn job_model(job: &Job) -> QueueResult<jobs::ActiveModel> {
    Ok(jobs::ActiveModel {
        id: Set(job.id.to_string()),
        function: Set(job.function.clone()),
        channel: Set(job.channel.clone()),
        state: Set(job.state.to_string()),
        ready_at: Set(millis(job.ready_at())),
        created_at: Set(job.created_at),
        schedule_id: Set(job.schedule_id.clone()),
        leased_by: Set(job.leased_by.clone()),
        expires_at: Set(job.expires_at.map(millis)),
        document: Set(serde_json::to_string(job)?),
    })
}

fn job_from_model(model: jobs::Model) -> QueueResult<Job> {
    Ok(serde_json::from_str(&model.document)?)
}

fn schedule_model(schedule: &Schedule) -> QueueResult<schedules::ActiveModel> {
    Ok(schedules::ActiveModel {
        id: Set(schedule.id.clone()),
        name: Set(schedule.name.clone()),
        status: Set(schedule.status.to_string()),
        next_fire_at: Set(schedule.next_fire_time.map(millis)),
        document: Set(serde_json::to_string(schedule)?),
        created_at: Set(schedule.created_at),
        updated_at: Set(schedule.updated_at),
    })
}

fn schedule_from_model(model: schedules::Model) -> QueueResult<Schedule> {
    Ok(serde_json::from_str(&model.document)?)
}

/// SQLite, PostgreSQL or MySQL job store
#[derive(Clone)]
pub struct RelationalBackend {
    database: Database,
}

impl RelationalBackend {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.database.connection()
    }

    async fn find_job(&self, id: JobId) -> QueueResult<Option<jobs::Model>> {
        Ok(Jobs::find_by_id(id.to_string()).one(self.conn()).await?)
    }

    /// Write `job` only if the stored row is still in `expected` state
    async fn update_job_if(&self, job: &Job, expected: JobState) -> QueueResult<bool> {
        let result = Jobs::update_many()
            .set(job_model(job)?)
            .filter(jobs::Column::Id.eq(job.id.to_string()))
            .filter(jobs::Column::State.eq(expected.to_string()))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn try_lease(&self, channels: &[String], worker_id: &str) -> QueueResult<Option<Job>> {
        for channel in channels {
            let now = Utc::now();
            let candidates = Jobs::find()
                .filter(jobs::Column::State.eq(JobState::Pending.to_string()))
                .filter(jobs::Column::Channel.eq(channel.as_str()))
                .filter(jobs::Column::ReadyAt.lte(millis(now)))
                .order_by_asc(jobs::Column::ReadyAt)
                .order_by_asc(jobs::Column::CreatedAt)
                .limit(LEASE_BATCH)
                .all(self.conn())
                .await?;

            for model in candidates {
                let mut job = job_from_model(model)?;
                job.mark_running(worker_id, now);
                if self.update_job_if(&job, JobState::Pending).await? {
                    debug!("Leased job {} to {}", job.id, worker_id);
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        self.database.kind()
    }

    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        job_model(&job)?.insert(self.conn()).await?;
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
        if let Some(model) = self.find_job(id).await? {
            let mut job = job_from_model(model)?;
            job.attempts = attempt;
            if !self.update_job_if(&job, JobState::Running).await? {
                debug!("Job {} left the running state before attempt {}", id, attempt);
            }
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, outcome: JobCompletion) -> QueueResult<bool> {
        let Some(model) = self.find_job(id).await? else {
            return Ok(false);
        };
        let mut job = job_from_model(model)?;
        if job.state != JobState::Running {
            return Ok(false);
        }
        job.finish(&outcome, Utc::now());
        self.update_job_if(&job, JobState::Running).await
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.find_job(id).await?.map(job_from_model).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let mut query = Jobs::find();
        if let Some(state) = filter.state {
            query = query.filter(jobs::Column::State.eq(state.to_string()));
        }
        if let Some(channel) = &filter.channel {
            query = query.filter(jobs::Column::Channel.eq(channel.as_str()));
        }
        if let Some(schedule_id) = &filter.schedule_id {
            query = query.filter(jobs::Column::ScheduleId.eq(schedule_id.as_str()));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit as u64);
        }
        query
            .order_by_asc(jobs::Column::CreatedAt)
            .order_by_asc(jobs::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    /// Pending jobs only; a job already leased by a worker cannot be stopped here
    async fn cancel_job(&self, id: JobId) -> QueueResult<bool> {
        let Some(model) = self.find_job(id).await? else {
            return Ok(false);
        };
        let mut job = job_from_model(model)?;
        match job.state {
            JobState::Pending => {
                job.mark_cancelled(Utc::now());
                if self.update_job_if(&job, JobState::Pending).await? {
                    return Ok(true);
                }
                warn!("Job {} was leased while being cancelled", id);
                Err(QueueError::unsupported("cancel running job", self.kind().as_ref()))
            }
            JobState::Running => Err(QueueError::unsupported(
                "cancel running job",
                self.kind().as_ref(),
            )),
            _ => Ok(false),
        }
    }

    async fn delete_job(&self, id: JobId) -> QueueResult<bool> {
        let result = Jobs::delete_by_id(id.to_string()).exec(self.conn()).await?;
        Ok(result.rows_affected > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let terminal = [JobState::Succeeded, JobState::Failed, JobState::Cancelled]
            .map(|state| state.to_string());
        let result = Jobs::delete_many()
            .filter(jobs::Column::State.is_in(terminal))
            .filter(jobs::Column::ExpiresAt.lte(millis(now)))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn insert_schedule(&self, schedule: &Schedule, replace: bool) -> QueueResult<bool> {
        let existing = Schedules::find_by_id(schedule.id.clone())
            .one(self.conn())
            .await?;
        match existing {
            Some(_) if !replace => Ok(false),
            Some(_) => {
                schedule_model(schedule)?.update(self.conn()).await?;
                Ok(true)
            }
            None => match schedule_model(schedule)?.insert(self.conn()).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    // Lost a race with another insert of the same id
                    if self.get_schedule(&schedule.id).await?.is_some() {
                        Ok(false)
                    } else {
                        Err(e.into())
                    }
                }
            },
        }
    }

    async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>> {
        Schedules::find_by_id(id.to_string())
            .one(self.conn())
            .await?
            .map(schedule_from_model)
            .transpose()
    }

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>> {
        Schedules::find()
            .order_by_asc(schedules::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(schedule_from_model)
            .collect()
    }

    async fn update_schedule(&self, schedule: &Schedule) -> QueueResult<bool> {
        let result = Schedules::update_many()
            .set(schedule_model(schedule)?)
            .filter(schedules::Column::Id.eq(schedule.id.as_str()))
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// The claim and the job row commit together; any failure rolls both back
    async fn fire_schedule(
        &self,
        schedule: &Schedule,
        expected: DateTime<Utc>,
        job: Job,
    ) -> QueueResult<bool> {
        let txn = self.conn().begin().await?;
        let claimed = Schedules::update_many()
            .set(schedule_model(schedule)?)
            .filter(schedules::Column::Id.eq(schedule.id.as_str()))
            .filter(schedules::Column::Status.eq(ScheduleStatus::Active.to_string()))
            .filter(schedules::Column::NextFireAt.eq(millis(expected)))
            .exec(&txn)
            .await?;
        if claimed.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(false);
        }
        job_model(&job)?.insert(&txn).await?;
        txn.commit().await?;
        debug!(
            "Schedule {} enqueued job {} on channel '{}'",
            schedule.id, job.id, job.channel
        );
        Ok(true)
    }

    async fn delete_schedule(&self, id: &str) -> QueueResult<bool> {
        let result = Schedules::delete_by_id(id.to_string())
            .exec(self.conn())
            .await?;
        Ok(result.rows_affected > 0)
    }
}
