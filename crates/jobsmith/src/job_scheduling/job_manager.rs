//! Job submission and result retrieval

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::types::{Job, JobArgs, JobEvent, JobFilter, JobId, JobOptions, JobResult};
use crate::backends::JobBackend;
use crate::backends::events::EventBroker;
use crate::config::JobDefaultsConfig;
use crate::errors::{QueueError, QueueResult};

/// Submits jobs to the backend and reads their outcomes back
pub struct JobManager {
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventBroker>,
    defaults: JobDefaultsConfig,
    result_poll_interval: Duration,
}

impl JobManager {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventBroker>,
        defaults: JobDefaultsConfig,
        result_poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            events,
            defaults,
            result_poll_interval,
        }
    }

    /// Submit a job; with neither `run_at` nor `run_in` it is eligible immediately
    pub async fn add_job(
        &self,
        function: &str,
        args: JobArgs,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        if function.trim().is_empty() {
            return Err(QueueError::configuration("job function must not be empty"));
        }
        if let Some(retry) = &options.retry {
            retry.validate()?;
        }

        let now = Utc::now();
        let scheduled_for = options.scheduled_for(now);
        let job = Job::new(function, args, options.resolve(&self.defaults), scheduled_for, now);
        let job_id = job.id;
        let channel = job.channel.clone();

        self.backend.enqueue(job).await?;
        // The job is stored; waiters still see it through result polling
        if let Err(e) = self
            .events
            .publish(JobEvent::Enqueued {
                job_id,
                channel: channel.clone(),
            })
            .await
        {
            warn!("Failed to publish enqueue event for job {}: {}", job_id, e);
        }

        match scheduled_for {
            Some(at) => info!(
                "Added job {} ({}) on '{}' for {}",
                job_id,
                function,
                channel,
                at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => info!("Added job {} ({}) on '{}'", job_id, function, channel),
        }
        Ok(job_id)
    }

    /// Submit a job and block until it reaches a terminal state
    ///
    /// A failed job surfaces as [`QueueError::JobFailed`] carrying the run
    /// function's own error.
    pub async fn run_job(
        &self,
        function: &str,
        args: JobArgs,
        options: JobOptions,
    ) -> QueueResult<Value> {
        let job_id = self.add_job(function, args, options).await?;
        match self.get_job_result(job_id, true).await? {
            JobResult::Value(value) => Ok(value),
            JobResult::NotReady => Err(QueueError::backend(format!(
                "job {job_id} finished without a terminal state"
            ))),
        }
    }

    /// Outcome of a job; without `wait` a non-terminal job yields `NotReady`
    pub async fn get_job_result(&self, job_id: JobId, wait: bool) -> QueueResult<JobResult> {
        if !wait {
            return self.require(job_id).await?.outcome();
        }

        // Subscribe before the first read so a finish in between is not missed
        let mut events = self.events.subscribe();
        loop {
            let result = self.require(job_id).await?.outcome()?;
            if result != JobResult::NotReady {
                return Ok(result);
            }

            let woken = tokio::time::timeout(self.result_poll_interval, async {
                loop {
                    match events.recv().await {
                        Ok(JobEvent::Finished { job_id: id, .. })
                        | Ok(JobEvent::Cancelled { job_id: id })
                            if id == job_id =>
                        {
                            return;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            })
            .await;
            if woken.is_ok() {
                debug!("Job {} finished event received", job_id);
            }
        }
    }

    async fn require(&self, job_id: JobId) -> QueueResult<Job> {
        self.backend
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::job_not_found(job_id))
    }

    /// Cancel a job; `false` when it is unknown or already terminal
    pub async fn cancel_job(&self, job_id: JobId) -> QueueResult<bool> {
        let cancelled = self.backend.cancel_job(job_id).await?;
        if cancelled {
            if let Err(e) = self.events.publish(JobEvent::Cancelled { job_id }).await {
                warn!("Failed to publish cancel event for job {}: {}", job_id, e);
            }
            info!("Cancelled job {}", job_id);
        }
        Ok(cancelled)
    }

    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.backend.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        self.backend.list_jobs(filter).await
    }

    /// Remove every trace of a job
    pub async fn delete_job(&self, job_id: JobId) -> QueueResult<bool> {
        let deleted = self.backend.delete_job(job_id).await?;
        if deleted {
            info!("Deleted job {}", job_id);
        }
        Ok(deleted)
    }

    /// Drop terminal jobs whose result TTL has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let purged = self.backend.purge_expired(now).await?;
        if purged > 0 {
            info!("Purged {} expired job results", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::events::LocalEventBroker;
    use crate::backends::memory::MemoryBackend;
    use crate::errors::JobError;
    use crate::job_scheduling::types::{JobCompletion, JobState};
    use serde_json::json;

    fn manager() -> (Arc<JobManager>, Arc<MemoryBackend>, Arc<LocalEventBroker>) {
        let backend = Arc::new(MemoryBackend::new());
        let events = Arc::new(LocalEventBroker::new());
        let manager = JobManager::new(
            backend.clone(),
            events.clone(),
            JobDefaultsConfig::default(),
            Duration::from_millis(50),
        );
        (Arc::new(manager), backend, events)
    }

    fn default_channel() -> Vec<String> {
        vec!["default".to_string()]
    }

    #[tokio::test]
    async fn test_run_at_wins_over_run_in() {
        let (manager, backend, _) = manager();
        let at = Utc::now() + chrono::Duration::hours(2);
        let id = manager
            .add_job(
                "echo",
                JobArgs::new(),
                JobOptions::new().run_at(at).run_in(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        let job = backend.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.scheduled_for, Some(at));
    }

    #[tokio::test]
    async fn test_result_is_not_ready_without_wait() {
        let (manager, _, _) = manager();
        let id = manager.add_job("echo", JobArgs::new(), JobOptions::new()).await.unwrap();
        assert_eq!(manager.get_job_result(id, false).await.unwrap(), JobResult::NotReady);
        assert!(matches!(
            manager.get_job_result(JobId::new(), false).await,
            Err(QueueError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiting_caller_is_woken_by_finish_event() {
        let (manager, backend, events) = manager();
        let id = manager.add_job("add", JobArgs::new(), JobOptions::new()).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_job_result(id, true).await })
        };

        backend
            .lease(&default_channel(), "w1", Duration::ZERO)
            .await
            .unwrap();
        backend
            .complete(id, JobCompletion::Succeeded(json!(42)))
            .await
            .unwrap();
        events
            .publish(JobEvent::Finished {
                job_id: id,
                state: JobState::Succeeded,
            })
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, JobResult::Value(json!(42)));
    }

    #[tokio::test]
    async fn test_failed_job_reraises_original_error() {
        let (manager, backend, _) = manager();
        let id = manager.add_job("fail", JobArgs::new(), JobOptions::new()).await.unwrap();
        backend
            .lease(&default_channel(), "w1", Duration::ZERO)
            .await
            .unwrap();
        let original = JobError::new("TransientError", "upstream timed out");
        backend
            .complete(id, JobCompletion::Failed(original.clone()))
            .await
            .unwrap();

        match manager.get_job_result(id, true).await {
            Err(QueueError::JobFailed { error, .. }) => assert_eq!(error, original),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (manager, _, _) = manager();
        let id = manager.add_job("echo", JobArgs::new(), JobOptions::new()).await.unwrap();
        assert!(manager.cancel_job(id).await.unwrap());
        assert!(!manager.cancel_job(id).await.unwrap());
        assert!(matches!(
            manager.get_job_result(id, true).await,
            Err(QueueError::JobCancelled { .. })
        ));

        assert!(manager.delete_job(id).await.unwrap());
        assert!(!manager.delete_job(id).await.unwrap());
        assert!(!manager.cancel_job(id).await.unwrap());
    }

    /// Event layer whose notifications never get through
    struct DisconnectedEvents(tokio::sync::broadcast::Sender<JobEvent>);

    #[async_trait::async_trait]
    impl EventBroker for DisconnectedEvents {
        async fn publish(&self, _event: JobEvent) -> QueueResult<()> {
            Err(QueueError::backend("notification channel closed"))
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
            self.0.subscribe()
        }
    }

    #[tokio::test]
    async fn test_stored_job_id_survives_a_failed_notification() {
        let backend = Arc::new(MemoryBackend::new());
        let (sender, _) = tokio::sync::broadcast::channel(4);
        let manager = JobManager::new(
            backend.clone(),
            Arc::new(DisconnectedEvents(sender)),
            JobDefaultsConfig::default(),
            Duration::from_millis(10),
        );

        let id = manager.add_job("echo", JobArgs::new(), JobOptions::new()).await.unwrap();
        assert_eq!(backend.len().await, 1);

        // Completion is still observed through polling
        backend
            .lease(&default_channel(), "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        backend
            .complete(id, JobCompletion::Succeeded(json!("done")))
            .await
            .unwrap();
        let result = manager.get_job_result(id, true).await.unwrap();
        assert_eq!(result, JobResult::Value(json!("done")));

        let pending = manager.add_job("echo", JobArgs::new(), JobOptions::new()).await.unwrap();
        assert!(manager.cancel_job(pending).await.unwrap());
        assert!(!manager.cancel_job(pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_function_name_is_rejected() {
        let (manager, _, _) = manager();
        let err = manager.add_job(" ", JobArgs::new(), JobOptions::new()).await.unwrap_err();
        assert!(err.is_configuration());
    }
}
