//! Process-kind worker pool driven by the built binary
//!
//! Each slot is a `jobsmith child` process; jobs go over its stdin and results
//! come back on its stdout.

use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use jobsmith::{
    Config, JobError, JobSchedulingAPI, QueueError,
    job_scheduling::{JobArgs, JobOptions, JobState, RetryPolicy, WorkerKind},
};

fn process_config() -> Config {
    let mut config = Config::default();
    config.worker.default_job_executor = WorkerKind::Process;
    config.worker.worker_program = Some(PathBuf::from(env!("CARGO_BIN_EXE_jobsmith")));
    config.worker.worker_args = Some(vec!["child".to_string()]);
    config.worker.poll_timeout = Duration::from_millis(50);
    config.worker.result_poll_interval = Duration::from_millis(25);
    config.worker.shutdown_grace = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn test_jobs_run_in_child_processes() -> Result<()> {
    let api = JobSchedulingAPI::from_config(&process_config()).await?;
    assert_eq!(api.worker_pool().kind(), WorkerKind::Process);
    api.start_worker_pool(2, true).await?;

    let value = api
        .run_job("add", JobArgs::positional([19, 23]), JobOptions::new())
        .await?;
    assert_eq!(value, json!(42.0));

    let pid = api.run_job("pid", JobArgs::new(), JobOptions::new()).await?;
    assert_ne!(pid, json!(std::process::id()));

    api.stop_worker_pool().await?;
    Ok(())
}

#[tokio::test]
async fn test_crashed_child_fails_the_job_and_is_replaced() -> Result<()> {
    let api = JobSchedulingAPI::from_config(&process_config()).await?;
    api.start_worker_pool(1, true).await?;

    let crashed = api
        .add_job("crash", JobArgs::new(), JobOptions::new().retry(RetryPolicy::none()))
        .await?;
    match api.get_job_result(crashed, true).await {
        Err(QueueError::JobFailed { error, .. }) => assert_eq!(error.kind, JobError::WORKER_CRASHED),
        other => panic!("expected a crashed job, got {other:?}"),
    }

    let value = api
        .run_job("echo", JobArgs::positional(["after crash"]), JobOptions::new())
        .await?;
    assert_eq!(value["args"], json!(["after crash"]));

    api.stop_worker_pool().await?;
    Ok(())
}

#[tokio::test]
async fn test_panics_are_reported_from_the_child() -> Result<()> {
    let api = JobSchedulingAPI::from_config(&process_config()).await?;
    api.start_worker_pool(1, true).await?;

    let id = api.add_job("panic", JobArgs::new(), JobOptions::new()).await?;
    assert!(api.get_job_result(id, true).await.is_err());
    let job = api.get_job(id).await?.expect("job kept");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.map(|e| e.kind), Some(JobError::PANIC.to_string()));

    api.stop_worker_pool().await?;
    Ok(())
}
