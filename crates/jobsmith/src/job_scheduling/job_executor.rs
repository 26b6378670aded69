//! Execution slots for the worker pool
//!
//! A [`SlotExecutor`] runs one job per slot and hands the outcome back to the
//! dispatcher. Thread and fiber kinds live here; the process kind is in
//! `child_process`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::FunctionRegistry;
use super::types::{JobArgs, JobId, WorkerKind};
use crate::errors::{JobError, JobOutcome, QueueError, QueueResult};

/// What a slot needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCall {
    pub job_id: JobId,
    pub function: String,
    pub args: JobArgs,
}

#[async_trait]
pub trait SlotExecutor: Send + Sync {
    fn kind(&self) -> WorkerKind;

    fn slots(&self) -> usize;

    /// Run a job on a free slot, waiting for one if all are busy
    async fn execute(&self, call: JobCall) -> JobOutcome;

    /// Let in-flight work finish within `grace`, then force what is left
    async fn shutdown(&self, grace: Duration);
}

struct Task {
    call: JobCall,
    reply: oneshot::Sender<JobOutcome>,
}

type TaskQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>;

fn build_slot_runtime() -> QueueResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(QueueError::from)
}

async fn next_task(queue: &tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>) -> Option<Task> {
    queue.lock().await.recv().await
}

async fn run_task(registry: &FunctionRegistry, task: Task) {
    let Task { call, reply } = task;
    debug!("Slot running job {} ({})", call.job_id, call.function);
    let outcome = registry.call(&call.function, call.args).await;
    if reply.send(outcome).is_err() {
        debug!("Dispatcher stopped waiting for job {}", call.job_id);
    }
}

/// Submission side shared by the in-process executors
struct TaskSender {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl TaskSender {
    fn new(sender: mpsc::UnboundedSender<Task>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    async fn submit(&self, call: JobCall, kind: WorkerKind) -> JobOutcome {
        let (reply, outcome) = oneshot::channel();
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(JobError::worker_crashed(format!("{kind} pool is shut down")));
        };
        if sender.send(Task { call, reply }).is_err() {
            return Err(JobError::worker_crashed(format!("{kind} slots have exited")));
        }
        outcome.await.unwrap_or_else(|_| {
            Err(JobError::worker_crashed(format!(
                "{kind} slot stopped before the job finished"
            )))
        })
    }

    /// Stop accepting work; slots exit once the queue drains
    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Join OS threads within `grace`; threads still running are detached
async fn join_threads(handles: Vec<JoinHandle<()>>, grace: Duration) {
    if handles.is_empty() {
        return;
    }
    let count = handles.len();
    let joiner = tokio::task::spawn_blocking(move || {
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked outside a job");
            }
        }
    });
    if tokio::time::timeout(grace, joiner).await.is_err() {
        warn!("Detaching {} worker threads still running after {:?}", count, grace);
    }
}

/// N named OS threads, each driving its own single-threaded runtime
pub struct ThreadExecutor {
    tasks: TaskSender,
    handles: Mutex<Vec<JoinHandle<()>>>,
    slots: usize,
}

impl ThreadExecutor {
    pub fn new(slots: usize, registry: FunctionRegistry) -> QueueResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: TaskQueue = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut handles = Vec::with_capacity(slots);
        for index in 0..slots {
            let queue = queue.clone();
            let registry = registry.clone();
            let handle = std::thread::Builder::new()
                .name(format!("jobsmith-worker-{index}"))
                .spawn(move || {
                    let runtime = match build_slot_runtime() {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!("Worker thread {} could not start a runtime: {}", index, e);
                            return;
                        }
                    };
                    runtime.block_on(async move {
                        while let Some(task) = next_task(&queue).await {
                            run_task(&registry, task).await;
                        }
                    });
                    debug!("Worker thread {} exiting", index);
                })?;
            handles.push(handle);
        }

        info!("Started {} worker threads", slots);
        Ok(Self {
            tasks: TaskSender::new(sender),
            handles: Mutex::new(handles),
            slots,
        })
    }
}

#[async_trait]
impl SlotExecutor for ThreadExecutor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn slots(&self) -> usize {
        self.slots
    }

    async fn execute(&self, call: JobCall) -> JobOutcome {
        self.tasks.submit(call, WorkerKind::Thread).await
    }

    async fn shutdown(&self, grace: Duration) {
        self.tasks.close();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        join_threads(handles, grace).await;
    }
}

/// N cooperative tasks on one OS thread
///
/// A blocking run function holds the thread and starves the other fibers
/// until it returns.
pub struct FiberExecutor {
    tasks: TaskSender,
    handle: Mutex<Option<JoinHandle<()>>>,
    force: CancellationToken,
    slots: usize,
}

impl FiberExecutor {
    pub fn new(slots: usize, registry: FunctionRegistry) -> QueueResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let force = CancellationToken::new();
        let stop = force.clone();

        let handle = std::thread::Builder::new()
            .name("jobsmith-fibers".to_string())
            .spawn(move || {
                let runtime = match build_slot_runtime() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Fiber thread could not start a runtime: {}", e);
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    let queue = Rc::new(tokio::sync::Mutex::new(receiver));
                    let fibers: Vec<_> = (0..slots)
                        .map(|_| {
                            let queue = queue.clone();
                            let registry = registry.clone();
                            tokio::task::spawn_local(async move {
                                while let Some(task) = next_task(&queue).await {
                                    run_task(&registry, task).await;
                                }
                            })
                        })
                        .collect();

                    tokio::select! {
                        _ = futures::future::join_all(fibers) => {}
                        _ = stop.cancelled() => debug!("Dropping in-flight fibers"),
                    }
                });
                // Dropping the LocalSet drops any fiber still running
            })?;

        info!("Started {} fibers on one thread", slots);
        Ok(Self {
            tasks: TaskSender::new(sender),
            handle: Mutex::new(Some(handle)),
            force,
            slots,
        })
    }
}

#[async_trait]
impl SlotExecutor for FiberExecutor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Fiber
    }

    fn slots(&self) -> usize {
        self.slots
    }

    async fn execute(&self, call: JobCall) -> JobOutcome {
        self.tasks.submit(call, WorkerKind::Fiber).await
    }

    async fn shutdown(&self, grace: Duration) {
        self.tasks.close();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        let mut joiner = tokio::task::spawn_blocking(move || handle.join());
        if tokio::time::timeout(grace, &mut joiner).await.is_err() {
            warn!("Fibers still running after {:?}, dropping them", grace);
            self.force.cancel();
            if tokio::time::timeout(Duration::from_secs(1), joiner).await.is_err() {
                warn!("Fiber thread is blocked in a run function, detaching it");
            }
        }
    }
}

/// Build the executor for `kind` with `slots` slots
pub fn build_executor(
    kind: WorkerKind,
    slots: usize,
    registry: FunctionRegistry,
    worker: &crate::config::WorkerConfig,
) -> QueueResult<Arc<dyn SlotExecutor>> {
    if slots == 0 {
        return Err(QueueError::configuration("a worker pool needs at least one slot"));
    }
    let executor: Arc<dyn SlotExecutor> = match kind {
        WorkerKind::Thread => Arc::new(ThreadExecutor::new(slots, registry)?),
        WorkerKind::Fiber => Arc::new(FiberExecutor::new(slots, registry)?),
        WorkerKind::Process => Arc::new(super::child_process::ProcessExecutor::new(slots, worker)?),
    };
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::builtin::register_builtins;
    use serde_json::json;
    use std::time::Instant;

    fn call(function: &str, args: JobArgs) -> JobCall {
        JobCall {
            job_id: JobId::new(),
            function: function.to_string(),
            args,
        }
    }

    fn registry() -> FunctionRegistry {
        let registry = FunctionRegistry::new();
        register_builtins(&registry);
        registry.register_blocking("thread_name", |_| {
            Ok(json!(std::thread::current().name().map(str::to_string)))
        });
        registry.register_blocking("block", |args: JobArgs| {
            let ms = args.get("ms", 0).and_then(|v| v.as_u64()).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        });
        registry
    }

    #[tokio::test]
    async fn test_thread_slots_run_on_named_threads() {
        let executor = ThreadExecutor::new(2, registry()).unwrap();
        let name = executor.execute(call("thread_name", JobArgs::new())).await.unwrap();
        assert!(name.as_str().unwrap().starts_with("jobsmith-worker-"));
        executor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_thread_slots_run_in_parallel() {
        let executor = Arc::new(ThreadExecutor::new(4, registry()).unwrap());
        let started = Instant::now();
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute(call("block", JobArgs::new().kwarg("ms", 200)))
                        .await
                })
            })
            .collect();
        for run in runs {
            assert_eq!(run.await.unwrap().unwrap(), json!(200));
        }
        assert!(started.elapsed() < Duration::from_millis(700));
        executor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_function_does_not_kill_the_slot() {
        let executor = ThreadExecutor::new(1, registry()).unwrap();
        let err = executor.execute(call("panic", JobArgs::new())).await.unwrap_err();
        assert_eq!(err.kind, JobError::PANIC);

        let value = executor
            .execute(call("add", JobArgs::positional([1, 2])))
            .await
            .unwrap();
        assert_eq!(value, json!(3.0));
        executor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_function_and_closed_pool() {
        let executor = ThreadExecutor::new(1, registry()).unwrap();
        let err = executor.execute(call("missing", JobArgs::new())).await.unwrap_err();
        assert_eq!(err.kind, JobError::UNKNOWN_FUNCTION);

        executor.shutdown(Duration::from_secs(1)).await;
        let err = executor.execute(call("echo", JobArgs::new())).await.unwrap_err();
        assert_eq!(err.kind, JobError::WORKER_CRASHED);
    }

    #[tokio::test]
    async fn test_fibers_share_one_thread() {
        let executor = Arc::new(FiberExecutor::new(3, registry()).unwrap());
        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(executor.execute(call("thread_name", JobArgs::new())).await.unwrap());
        }
        assert!(names.iter().all(|n| n == &json!("jobsmith-fibers")));

        // Async functions interleave on the single thread
        let started = Instant::now();
        let runs: Vec<_> = (0..3)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute(call("sleep", JobArgs::new().kwarg("seconds", 0.2)))
                        .await
                })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        executor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_fiber_shutdown_drops_unfinished_work() {
        let executor = Arc::new(FiberExecutor::new(1, registry()).unwrap());
        let pending = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(call("sleep", JobArgs::new().kwarg("seconds", 30)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.shutdown(Duration::from_millis(100)).await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, JobError::WORKER_CRASHED);
    }
}
