//! Process-kind worker slots
//!
//! Each slot owns one child process. The parent writes a [`ChildRequest`] as a
//! JSON line to the child's stdin and reads a [`ChildResponse`] line back from
//! its stdout; nothing else is shared. Children run in their own process
//! group so a terminal's Ctrl-C reaches only the supervisor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job_executor::{JobCall, SlotExecutor};
use super::registry::FunctionRegistry;
use super::types::{JobId, WorkerKind};
use crate::config::WorkerConfig;
use crate::errors::{JobError, JobOutcome, QueueError, QueueResult};

/// Subcommand a child is started with when no `worker_args` are configured
pub const CHILD_SUBCOMMAND: &str = "child";

pub type ChildRequest = JobCall;

/// One job's outcome as reported by a child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildResponse {
    Succeeded { job_id: JobId, value: Value },
    Failed { job_id: JobId, error: JobError },
}

impl ChildResponse {
    pub fn new(job_id: JobId, outcome: JobOutcome) -> Self {
        match outcome {
            Ok(value) => ChildResponse::Succeeded { job_id, value },
            Err(error) => ChildResponse::Failed { job_id, error },
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            ChildResponse::Succeeded { job_id, .. } | ChildResponse::Failed { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn into_outcome(self) -> JobOutcome {
        match self {
            ChildResponse::Succeeded { value, .. } => Ok(value),
            ChildResponse::Failed { error, .. } => Err(error),
        }
    }
}

/// Child-side loop: answer requests from stdin until it closes
pub async fn serve_stdio(registry: FunctionRegistry) -> QueueResult<()> {
    let mut requests = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("Worker child {} ready", std::process::id());

    while let Some(line) = requests.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: ChildRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed job request: {}", e);
                continue;
            }
        };
        debug!("Child running job {} ({})", request.job_id, request.function);
        let outcome = registry.call(&request.function, request.args).await;

        let mut response = serde_json::to_string(&ChildResponse::new(request.job_id, outcome))?;
        response.push('\n');
        stdout.write_all(response.as_bytes()).await?;
        stdout.flush().await?;
    }

    debug!("Worker child {} stdin closed, exiting", std::process::id());
    Ok(())
}

struct ChildSlot {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ChildSlot {
    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Worker child already gone: {}", e);
        }
    }
}

/// N child processes, spawned lazily and respawned after a crash
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    children: Vec<tokio::sync::Mutex<Option<ChildSlot>>>,
    idle: Mutex<Vec<usize>>,
    permits: Semaphore,
    force: CancellationToken,
}

impl ProcessExecutor {
    pub fn new(slots: usize, config: &WorkerConfig) -> QueueResult<Self> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let args = config
            .worker_args
            .clone()
            .unwrap_or_else(|| vec![CHILD_SUBCOMMAND.to_string()]);

        info!(
            "Process pool of {} slots will run {} {}",
            slots,
            program.display(),
            args.join(" ")
        );
        Ok(Self {
            program,
            args,
            children: (0..slots).map(|_| tokio::sync::Mutex::new(None)).collect(),
            idle: Mutex::new((0..slots).rev().collect()),
            permits: Semaphore::new(slots),
            force: CancellationToken::new(),
        })
    }

    fn spawn(&self, slot: usize) -> QueueResult<ChildSlot> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| QueueError::worker("child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QueueError::worker("child stdout was not captured"))?;

        info!("Spawned worker child {:?} for slot {}", child.id(), slot);
        Ok(ChildSlot {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn run_on_slot(&self, slot: usize, call: &JobCall) -> JobOutcome {
        let mut guard = self.children[slot].lock().await;
        if guard.is_none() {
            let spawned = self.spawn(slot).map_err(|e| {
                JobError::worker_crashed(format!("failed to spawn worker process: {e}"))
            })?;
            *guard = Some(spawned);
        }
        let Some(child) = guard.as_mut() else {
            return Err(JobError::worker_crashed("worker process unavailable"));
        };

        let mut request = serde_json::to_string(call)
            .map_err(|e| JobError::new("SerializationError", e.to_string()))?;
        request.push('\n');
        let written = async {
            child.stdin.write_all(request.as_bytes()).await?;
            child.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            if let Some(dead) = guard.take() {
                dead.kill().await;
            }
            return Err(JobError::worker_crashed(format!(
                "could not send job to worker process: {e}"
            )));
        }

        let read = async {
            loop {
                match child.stdout.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<ChildResponse>(&line) {
                        Ok(response) if response.job_id() == call.job_id => {
                            return Ok(response.into_outcome());
                        }
                        _ => debug!("Ignoring unexpected output from worker child: {}", line),
                    },
                    Ok(None) => return Err("worker process exited mid-job".to_string()),
                    Err(e) => return Err(format!("failed reading from worker process: {e}")),
                }
            }
        };

        let result = tokio::select! {
            result = read => result,
            _ = self.force.cancelled() => Err("worker process killed at shutdown".to_string()),
        };

        match result {
            Ok(outcome) => outcome,
            Err(reason) => {
                if let Some(mut dead) = guard.take() {
                    let status = match dead.child.try_wait() {
                        Ok(Some(status)) => status.to_string(),
                        _ => "still running".to_string(),
                    };
                    warn!("Worker child in slot {} lost ({}): {}", slot, status, reason);
                    dead.kill().await;
                }
                Err(JobError::worker_crashed(reason))
            }
        }
    }
}

#[async_trait]
impl SlotExecutor for ProcessExecutor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn slots(&self) -> usize {
        self.children.len()
    }

    async fn execute(&self, call: JobCall) -> JobOutcome {
        let Ok(_permit) = self.permits.acquire().await else {
            return Err(JobError::worker_crashed("process pool is shut down"));
        };
        let Some(slot) = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop() else {
            return Err(JobError::worker_crashed("no idle worker process"));
        };
        let outcome = self.run_on_slot(slot, &call).await;
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        outcome
    }

    async fn shutdown(&self, grace: Duration) {
        self.permits.close();
        let deadline = Instant::now() + grace;

        for (slot, lock) in self.children.iter().enumerate() {
            let Ok(mut guard) = tokio::time::timeout_at(deadline, lock.lock()).await else {
                debug!("Slot {} still busy at the grace deadline", slot);
                continue;
            };
            let Some(ChildSlot { mut child, stdin, .. }) = guard.take() else {
                continue;
            };
            // Closing stdin asks the child to exit
            drop(stdin);
            if tokio::time::timeout_at(deadline, child.wait()).await.is_err() {
                warn!("Killing worker child {:?} in slot {}", child.id(), slot);
                if let Err(e) = child.kill().await {
                    debug!("Worker child already gone: {}", e);
                }
            }
        }

        // Busy slots kill their own child when forced
        self.force.cancel();
        for lock in &self.children {
            let _ = tokio::time::timeout(Duration::from_secs(1), lock.lock()).await;
        }
        info!("Process pool stopped");
    }
}
