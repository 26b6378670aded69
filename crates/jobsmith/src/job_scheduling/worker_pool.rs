//! Worker pool supervisor
//!
//! Owns the dispatcher, the schedule ticker and the result cleanup ticker for
//! one running pool. Nothing here is global: each [`WorkerPool`] is started and
//! stopped explicitly.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_executor::build_executor;
use super::job_queue_runner::{ExecutionStats, JobQueueRunner};
use super::job_scheduler::ScheduleRegistry;
use super::registry::FunctionRegistry;
use super::types::WorkerKind;
use crate::backends::JobBackend;
use crate::backends::events::EventBroker;
use crate::config::WorkerConfig;
use crate::errors::{QueueError, QueueResult};

struct RunningPool {
    token: CancellationToken,
    runner: Arc<JobQueueRunner>,
    tasks: Vec<JoinHandle<()>>,
}

/// Supervises N execution slots of one kind plus the periodic services
pub struct WorkerPool {
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventBroker>,
    schedules: Arc<ScheduleRegistry>,
    functions: FunctionRegistry,
    config: WorkerConfig,
    kind: WorkerKind,
    running: Mutex<Option<RunningPool>>,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventBroker>,
        schedules: Arc<ScheduleRegistry>,
        functions: FunctionRegistry,
        config: WorkerConfig,
    ) -> Self {
        let kind = config.default_job_executor;
        Self {
            backend,
            events,
            schedules,
            functions,
            config,
            kind,
            running: Mutex::new(None),
        }
    }

    /// Use `kind` for pools started from now on
    pub fn with_kind(mut self, kind: WorkerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Start a pool with the configured number of slots
    pub async fn start_worker(&self, background: bool) -> QueueResult<()> {
        self.start_worker_pool(self.config.num_workers, background)
            .await
    }

    /// Start a pool of `n` slots
    ///
    /// In the background the call returns once the pool is running. In the
    /// foreground it waits for Ctrl-C or [`stop_worker_pool`](Self::stop_worker_pool)
    /// and returns after shutdown completes.
    pub async fn start_worker_pool(&self, n: usize, background: bool) -> QueueResult<()> {
        let token = {
            let mut running = self.running.lock().await;
            if running.is_some() {
                return Err(QueueError::WorkerPoolRunning);
            }
            let pool = self.spawn(n)?;
            let token = pool.token.clone();
            *running = Some(pool);
            token
        };

        if background {
            return Ok(());
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received Ctrl-C, stopping worker pool"),
                    Err(e) => error!("Could not listen for Ctrl-C: {}", e),
                }
            }
            _ = token.cancelled() => debug!("Worker pool stop requested"),
        }
        self.stop_worker_pool().await?;
        Ok(())
    }

    fn spawn(&self, n: usize) -> QueueResult<RunningPool> {
        self.config.validate()?;
        let executor = build_executor(self.kind, n, self.functions.clone(), &self.config)?;
        let runner = Arc::new(JobQueueRunner::new(
            self.backend.clone(),
            self.events.clone(),
            executor,
            self.config.queues.clone(),
            self.config.poll_timeout,
            self.config.shutdown_grace,
            self.config.max_concurrent_jobs,
        ));
        let token = CancellationToken::new();

        let dispatcher = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run(token).await {
                    error!("Job queue runner stopped with error: {}", e);
                }
            })
        };

        let ticker = {
            let schedules = self.schedules.clone();
            let token = token.clone();
            let period = self.config.scheduler_interval;
            tokio::spawn(async move { schedules.run(period, token).await })
        };

        let cleanup = {
            let backend = self.backend.clone();
            let token = token.clone();
            let period = self.config.cleanup_interval;
            tokio::spawn(async move { run_cleanup(backend, period, token).await })
        };

        info!(
            "Started {} worker pool with {} slots on {:?}",
            self.kind, n, self.config.queues
        );
        Ok(RunningPool {
            token,
            runner,
            tasks: vec![dispatcher, ticker, cleanup],
        })
    }

    pub async fn stop_worker(&self) -> QueueResult<bool> {
        self.stop_worker_pool().await
    }

    /// Stop leasing, drain in-flight jobs within the grace period and force the rest
    ///
    /// Returns `false` when no pool was running.
    pub async fn stop_worker_pool(&self) -> QueueResult<bool> {
        let Some(pool) = self.running.lock().await.take() else {
            return Ok(false);
        };

        info!("Stopping worker pool");
        pool.token.cancel();
        for task in pool.tasks {
            if let Err(e) = task.await {
                warn!("Worker pool task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
        Ok(true)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn stats(&self) -> Option<ExecutionStats> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.runner.get_execution_stats())
    }
}

/// Purge expired job results every `period` until cancelled
async fn run_cleanup(
    backend: Arc<dyn JobBackend>,
    period: std::time::Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match backend.purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(purged) => info!("Purged {} expired job results", purged),
                    Err(e) => error!("Error purging expired job results: {}", e),
                }
            }
            _ = cancellation_token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::events::LocalEventBroker;
    use crate::backends::memory::MemoryBackend;
    use crate::config::JobDefaultsConfig;
    use crate::job_scheduling::builtin::register_builtins;
    use crate::job_scheduling::job_manager::JobManager;
    use crate::job_scheduling::types::{JobArgs, JobFilter, JobOptions, NewSchedule};
    use crate::triggers::TriggerSpec;
    use serde_json::json;
    use std::time::Duration;

    fn fixture(kind: WorkerKind) -> (WorkerPool, JobManager, Arc<ScheduleRegistry>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let events = Arc::new(LocalEventBroker::new());
        let defaults = JobDefaultsConfig::default();
        let schedules = Arc::new(ScheduleRegistry::new(
            backend.clone(),
            events.clone(),
            defaults.clone(),
        ));
        let manager = JobManager::new(
            backend.clone(),
            events.clone(),
            defaults,
            Duration::from_millis(20),
        );
        let functions = FunctionRegistry::new();
        register_builtins(&functions);
        let config = WorkerConfig {
            poll_timeout: Duration::from_millis(50),
            scheduler_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::new(backend.clone(), events, schedules.clone(), functions, config)
            .with_kind(kind);
        (pool, manager, schedules, backend)
    }

    #[tokio::test]
    async fn test_start_and_stop_in_background() {
        let (pool, manager, _, _) = fixture(WorkerKind::Thread);
        pool.start_worker_pool(2, true).await.unwrap();
        assert!(pool.is_running().await);
        assert_eq!(pool.stats().await.unwrap().slots, 2);

        let value = manager
            .run_job("add", JobArgs::positional([2, 2]), JobOptions::new())
            .await
            .unwrap();
        assert_eq!(value, json!(4.0));

        assert!(pool.stop_worker_pool().await.unwrap());
        assert!(!pool.stop_worker_pool().await.unwrap());
        assert!(!pool.is_running().await);
    }

    #[tokio::test]
    async fn test_starting_twice_is_an_error() {
        let (pool, _, _, _) = fixture(WorkerKind::Fiber);
        pool.start_worker(true).await.unwrap();
        assert!(matches!(
            pool.start_worker(true).await,
            Err(QueueError::WorkerPoolRunning)
        ));
        pool.stop_worker().await.unwrap();

        // A stopped pool can be started again
        pool.start_worker(true).await.unwrap();
        pool.stop_worker().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_returns_after_external_stop() {
        let (pool, _, _, _) = fixture(WorkerKind::Fiber);
        let pool = Arc::new(pool);
        let foreground = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.start_worker_pool(1, false).await })
        };
        while !pool.is_running().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.stop_worker_pool().await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), foreground)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_runs_schedule_ticker() {
        let (pool, manager, schedules, _) = fixture(WorkerKind::Thread);
        schedules
            .add_schedule(
                NewSchedule::new("tick", "echo", TriggerSpec::every(Duration::from_secs(1)))
                    .repeat(2),
            )
            .await
            .unwrap();

        pool.start_worker_pool(1, true).await.unwrap();
        let mut finished = 0;
        for _ in 0..100 {
            let jobs = manager.list_jobs(&JobFilter::default()).await.unwrap();
            finished = jobs.iter().filter(|j| j.state.is_terminal()).count();
            if finished == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        pool.stop_worker_pool().await.unwrap();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_cleanup_ticker_purges_expired_results() {
        let (pool, manager, _, backend) = fixture(WorkerKind::Thread);
        pool.start_worker_pool(1, true).await.unwrap();

        manager
            .add_job("echo", JobArgs::new(), JobOptions::new().result_ttl(Duration::ZERO))
            .await
            .unwrap();
        for _ in 0..100 {
            if backend.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.stop_worker_pool().await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_zero_ticker_period_is_refused_before_anything_spawns() {
        let backend = Arc::new(MemoryBackend::new());
        let events = Arc::new(LocalEventBroker::new());
        let schedules = Arc::new(ScheduleRegistry::new(
            backend.clone(),
            events.clone(),
            JobDefaultsConfig::default(),
        ));
        let config = WorkerConfig {
            cleanup_interval: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::new(backend, events, schedules, FunctionRegistry::new(), config);

        let err = pool.start_worker_pool(1, true).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!pool.is_running().await);
    }
}
