//! External API for the job scheduling system
//!
//! One handle per backend: it opens the connection, then hands out the job
//! manager, the schedule registry and the worker pool built on top of it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::builtin::register_builtins;
use super::job_manager::JobManager;
use super::job_scheduler::ScheduleRegistry;
use super::registry::FunctionRegistry;
use super::types::{
    Job, JobArgs, JobFilter, JobId, JobOptions, JobResult, NewSchedule, Schedule, WorkerKind,
};
use super::worker_pool::WorkerPool;
use crate::backends::events::EventBroker;
use crate::backends::{BackendConnector, BackendKind, JobBackend};
use crate::config::Config;
use crate::errors::QueueResult;

/// Facade over jobs, schedules and the worker pool
#[derive(Clone)]
pub struct JobSchedulingAPI {
    connector: Arc<BackendConnector>,
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventBroker>,
    jobs: Arc<JobManager>,
    schedules: Arc<ScheduleRegistry>,
    pool: Arc<WorkerPool>,
    functions: FunctionRegistry,
}

impl JobSchedulingAPI {
    /// Connect to the configured backend with the built-in run functions registered
    pub async fn from_config(config: &Config) -> QueueResult<Self> {
        let functions = FunctionRegistry::new();
        register_builtins(&functions);
        Self::with_functions(config, functions).await
    }

    /// Connect to the configured backend using `functions` to resolve job targets
    pub async fn with_functions(config: &Config, functions: FunctionRegistry) -> QueueResult<Self> {
        config.validate()?;
        let connector = Arc::new(BackendConnector::new(&config.backend)?);
        let backend = connector.backend().await?;
        let events = connector.events().await?;

        let jobs = Arc::new(JobManager::new(
            backend.clone(),
            events.clone(),
            config.jobs.clone(),
            config.worker.result_poll_interval,
        ));
        let schedules = Arc::new(ScheduleRegistry::new(
            backend.clone(),
            events.clone(),
            config.jobs.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            backend.clone(),
            events.clone(),
            schedules.clone(),
            functions.clone(),
            config.worker.clone(),
        ));

        info!("Job scheduling ready on the {} backend", connector.kind());
        Ok(Self {
            connector,
            backend,
            events,
            jobs,
            schedules,
            pool,
            functions,
        })
    }

    /// Same handle with pools of a different slot kind
    pub fn with_worker_kind(&self, kind: WorkerKind, config: &Config) -> Self {
        let pool = WorkerPool::new(
            self.backend.clone(),
            self.events.clone(),
            self.schedules.clone(),
            self.functions.clone(),
            config.worker.clone(),
        )
        .with_kind(kind);
        Self {
            pool: Arc::new(pool),
            ..self.clone()
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.connector.kind()
    }

    pub fn connector(&self) -> &BackendConnector {
        &self.connector
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn schedules(&self) -> &ScheduleRegistry {
        &self.schedules
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    // Jobs

    pub async fn add_job(&self, function: &str, args: JobArgs, options: JobOptions) -> QueueResult<JobId> {
        self.jobs.add_job(function, args, options).await
    }

    pub async fn run_job(&self, function: &str, args: JobArgs, options: JobOptions) -> QueueResult<Value> {
        self.jobs.run_job(function, args, options).await
    }

    pub async fn get_job_result(&self, job_id: JobId, wait: bool) -> QueueResult<JobResult> {
        self.jobs.get_job_result(job_id, wait).await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> QueueResult<bool> {
        self.jobs.cancel_job(job_id).await
    }

    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.jobs.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        self.jobs.list_jobs(filter).await
    }

    pub async fn delete_job(&self, job_id: JobId) -> QueueResult<bool> {
        self.jobs.delete_job(job_id).await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        self.jobs.purge_expired(now).await
    }

    // Schedules

    pub async fn add_schedule(&self, request: NewSchedule) -> QueueResult<Schedule> {
        self.schedules.add_schedule(request).await
    }

    pub async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>> {
        self.schedules.get_schedule(id).await
    }

    pub async fn get_schedules(&self) -> QueueResult<Vec<Schedule>> {
        self.schedules.get_schedules().await
    }

    pub async fn pause_schedule(&self, id: &str) -> QueueResult<bool> {
        self.schedules.pause_schedule(id).await
    }

    pub async fn resume_schedule(&self, id: &str) -> QueueResult<bool> {
        self.schedules.resume_schedule(id).await
    }

    pub async fn cancel_schedule(&self, id: &str) -> QueueResult<bool> {
        self.schedules.cancel_schedule(id).await
    }

    pub async fn delete_schedule(&self, id: &str) -> QueueResult<bool> {
        self.schedules.delete_schedule(id).await
    }

    pub async fn pause_all(&self) -> QueueResult<usize> {
        self.schedules.pause_all().await
    }

    pub async fn resume_all(&self) -> QueueResult<usize> {
        self.schedules.resume_all().await
    }

    pub async fn cancel_all(&self) -> QueueResult<usize> {
        self.schedules.cancel_all().await
    }

    pub async fn delete_all(&self) -> QueueResult<usize> {
        self.schedules.delete_all().await
    }

    // Workers

    pub async fn start_worker(&self, background: bool) -> QueueResult<()> {
        self.pool.start_worker(background).await
    }

    pub async fn start_worker_pool(&self, n: usize, background: bool) -> QueueResult<()> {
        self.pool.start_worker_pool(n, background).await
    }

    pub async fn stop_worker(&self) -> QueueResult<bool> {
        self.pool.stop_worker().await
    }

    pub async fn stop_worker_pool(&self) -> QueueResult<bool> {
        self.pool.stop_worker_pool().await
    }
}
