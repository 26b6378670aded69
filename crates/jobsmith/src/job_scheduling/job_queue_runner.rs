//! Dispatcher that leases jobs and hands them to execution slots

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job_executor::{JobCall, SlotExecutor};
use super::types::{Job, JobCompletion, JobEvent, JobFilter, JobId, JobState, WorkerKind};
use crate::backends::JobBackend;
use crate::backends::events::EventBroker;
use crate::errors::{JobError, QueueResult};
use crate::utils::retry::execute_with_retry;

/// Error kind used to stop retrying a job that left the running state
const ABANDONED: &str = "Abandoned";

/// Leases ready jobs and runs each on an execution slot
pub struct JobQueueRunner {
    worker_id: String,
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventBroker>,
    executor: Arc<dyn SlotExecutor>,
    queues: Vec<String>,
    poll_timeout: Duration,
    shutdown_grace: Duration,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<JobId, AbortHandle>>>,
    force: CancellationToken,
}

/// Statistics about job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStats {
    pub kind: WorkerKind,
    pub slots: usize,
    pub running: usize,
    pub max_concurrent: usize,
}

/// Unique id recorded on every job this dispatcher leases
pub fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

impl JobQueueRunner {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventBroker>,
        executor: Arc<dyn SlotExecutor>,
        queues: Vec<String>,
        poll_timeout: Duration,
        shutdown_grace: Duration,
        max_concurrent: Option<usize>,
    ) -> Self {
        let max_concurrent = max_concurrent.unwrap_or_else(|| executor.slots()).max(1);
        Self {
            worker_id: generate_worker_id(),
            backend,
            events,
            executor,
            queues,
            poll_timeout,
            shutdown_grace,
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            force: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lease and execute until cancelled, then drain or force what is in flight
    pub async fn run(&self, cancellation_token: CancellationToken) -> QueueResult<()> {
        info!(
            worker_id = %self.worker_id,
            "Starting job queue runner ({} {} slots, max concurrent {}, queues {:?})",
            self.executor.slots(),
            self.executor.kind(),
            self.max_concurrent,
            self.queues
        );

        while !cancellation_token.is_cancelled() {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancellation_token.cancelled() => break,
            };

            // Not raced against cancellation: a lease interrupted after it
            // committed would strand the job in the running state
            match self
                .backend
                .lease(&self.queues, &self.worker_id, self.poll_timeout)
                .await
            {
                Ok(Some(job)) => self.dispatch(job, permit),
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.worker_id, "Error leasing jobs: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_timeout) => {}
                        _ = cancellation_token.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Job queue runner received cancellation signal");
        self.wait_for_running_jobs_to_complete().await;
        info!(worker_id = %self.worker_id, "Job queue runner service stopped");
        Ok(())
    }

    /// Run a leased job on its own task, holding `permit` until it is stored
    fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        info!(job_id = %job_id, "Starting job {} on channel {}", job.function, job.channel);

        let backend = self.backend.clone();
        let events = self.events.clone();
        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        let force = self.force.clone();

        // Registration happens under the lock so the task cannot remove itself first
        let mut tracked = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let completion = Self::execute_job(job, &backend, &executor, &force).await;
            let elapsed = started.elapsed();

            let state = match &completion {
                JobCompletion::Succeeded(_) => {
                    info!(job_id = %job_id, "Job completed successfully in {:?}", elapsed);
                    JobState::Succeeded
                }
                JobCompletion::Failed(e) => {
                    error!(job_id = %job_id, "Job failed after {:?}: {}", elapsed, e);
                    JobState::Failed
                }
            };
            Self::store_outcome(&backend, &events, job_id, completion, state).await;

            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
            drop(permit);
        });
        tracked.insert(job_id, handle.abort_handle());
    }

    /// Run every attempt of a job under its retry policy
    async fn execute_job(
        job: Job,
        backend: &Arc<dyn JobBackend>,
        executor: &Arc<dyn SlotExecutor>,
        force: &CancellationToken,
    ) -> JobCompletion {
        let Job {
            id: job_id,
            function,
            args,
            retry: policy,
            ..
        } = job;
        let name = format!("{function} ({job_id})");

        let outcome = execute_with_retry(
            &name,
            &policy,
            |attempt| {
                let call = JobCall {
                    job_id,
                    function: function.clone(),
                    args: args.clone(),
                };
                async move {
                    if attempt > 1 {
                        match backend.get_job(job_id).await {
                            Ok(Some(current)) if current.state == JobState::Running => {}
                            Ok(_) => {
                                return Err(JobError::new(ABANDONED, "job is no longer running"));
                            }
                            Err(e) => warn!(job_id = %job_id, "Could not re-check job: {}", e),
                        }
                    }
                    if let Err(e) = backend.record_attempt(job_id, attempt).await {
                        warn!(job_id = %job_id, "Could not record attempt {}: {}", attempt, e);
                    }
                    executor.execute(call).await
                }
            },
            |e: &JobError| e.kind != ABANDONED && !force.is_cancelled() && policy.is_retryable(e),
        )
        .await;

        JobCompletion::from(outcome)
    }

    async fn store_outcome(
        backend: &Arc<dyn JobBackend>,
        events: &Arc<dyn EventBroker>,
        job_id: JobId,
        completion: JobCompletion,
        state: JobState,
    ) {
        match backend.complete(job_id, completion).await {
            Ok(true) => {
                if let Err(e) = events.publish(JobEvent::Finished { job_id, state }).await {
                    warn!(job_id = %job_id, "Could not publish job event: {}", e);
                }
            }
            Ok(false) => debug!(job_id = %job_id, "Job left the running state before completing"),
            Err(e) => error!(job_id = %job_id, "Could not store job outcome: {}", e),
        }
    }

    /// Wait up to the grace period for in-flight jobs, then force the rest
    async fn wait_for_running_jobs_to_complete(&self) {
        let deadline = Instant::now() + self.shutdown_grace;
        let running = self.running_count();
        if running > 0 {
            info!("Waiting up to {:?} for {} running jobs to complete...", self.shutdown_grace, running);
            self.dump_job_status().await;
        }

        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        match tokio::time::timeout_at(deadline, self.permits.acquire_many(all)).await {
            Ok(_) => info!("All jobs completed"),
            Err(_) => self.force_remaining().await,
        }
        self.permits.close();

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.executor.shutdown(remaining).await;
    }

    /// Abort in-flight jobs and record them as crashed
    async fn force_remaining(&self) {
        self.force.cancel();
        let abandoned: Vec<(JobId, AbortHandle)> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        warn!(
            "Timeout waiting for {} jobs to complete, forcing termination",
            abandoned.len()
        );

        for (job_id, handle) in abandoned {
            handle.abort();
            let error = JobError::worker_crashed("worker pool stopped before the job finished");
            Self::store_outcome(
                &self.backend,
                &self.events,
                job_id,
                JobCompletion::Failed(error),
                JobState::Failed,
            )
            .await;
        }
    }

    fn running_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dump current job status for debugging
    async fn dump_job_status(&self) {
        let stats = self.get_execution_stats();
        info!("=== JOB STATUS DUMP ===");
        info!(
            "Running: {}, Max Concurrent: {}, Slots: {} ({})",
            stats.running, stats.max_concurrent, stats.slots, stats.kind
        );

        let filter = JobFilter {
            state: Some(JobState::Running),
            ..JobFilter::default()
        };
        match self.backend.list_jobs(&filter).await {
            Ok(jobs) => {
                for job in jobs
                    .iter()
                    .filter(|job| job.leased_by.as_deref() == Some(self.worker_id.as_str()))
                {
                    let since = job
                        .started_at
                        .map(|at| (Utc::now() - at).num_milliseconds())
                        .unwrap_or_default();
                    info!("  - {} {} (running {}ms, attempt {})", job.id, job.function, since, job.attempts);
                }
            }
            Err(e) => debug!("Could not list running jobs: {}", e),
        }
        info!("=== END JOB STATUS DUMP ===");
    }

    /// Get current execution statistics
    pub fn get_execution_stats(&self) -> ExecutionStats {
        ExecutionStats {
            kind: self.executor.kind(),
            slots: self.executor.slots(),
            running: self.running_count(),
            max_concurrent: self.max_concurrent,
        }
    }
}
