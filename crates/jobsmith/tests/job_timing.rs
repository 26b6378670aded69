//! Wall-clock behaviour of delayed jobs and retries on the memory backend

use anyhow::Result;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobsmith::{
    Config, JobError, JobSchedulingAPI, QueueError,
    job_scheduling::{FunctionRegistry, JobArgs, JobOptions, JobState, RetryPolicy},
};

fn memory_config() -> Config {
    let mut config = Config::default();
    config.worker.poll_timeout = Duration::from_millis(50);
    config.worker.result_poll_interval = Duration::from_millis(25);
    config
}

#[tokio::test]
async fn test_run_in_delays_the_result() -> Result<()> {
    let functions = FunctionRegistry::new();
    functions.register_blocking("answer", |_| Ok(json!(42)));
    let api = JobSchedulingAPI::with_functions(&memory_config(), functions).await?;
    api.start_worker_pool(1, true).await?;

    let started = Instant::now();
    let id = api
        .add_job("answer", JobArgs::new(), JobOptions::new().run_in(Duration::from_secs(5)))
        .await?;
    let value = api.get_job_result(id, true).await?.into_value();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(value, Some(json!(42)));

    api.stop_worker_pool().await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_back_off_exponentially() -> Result<()> {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let functions = FunctionRegistry::new();
    {
        let attempts = attempts.clone();
        functions.register_blocking("flaky_export", move |_| {
            attempts.lock().unwrap().push(Instant::now());
            Err(JobError::new("TransientError", "upstream unavailable"))
        });
    }
    let api = JobSchedulingAPI::with_functions(&memory_config(), functions).await?;
    api.start_worker_pool(1, true).await?;

    let policy = RetryPolicy::new(3, Duration::from_secs(1), 0.0);
    let id = api
        .add_job("flaky_export", JobArgs::new(), JobOptions::new().retry(policy))
        .await?;
    match api.get_job_result(id, true).await {
        Err(QueueError::JobFailed { error, .. }) => assert_eq!(error.kind, "TransientError"),
        other => panic!("expected a failed job, got {other:?}"),
    }

    let stamps = attempts.lock().unwrap().clone();
    assert_eq!(stamps.len(), 4);
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1u64, 2, 4]) {
        let expected = Duration::from_secs(expected);
        assert!(*gap >= expected, "gap {gap:?} shorter than {expected:?}");
        assert!(*gap < expected + Duration::from_millis(750), "gap {gap:?} too long");
    }

    let job = api.get_job(id).await?.expect("job kept");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 4);

    api.stop_worker_pool().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() -> Result<()> {
    let ran = Arc::new(Mutex::new(false));
    let functions = FunctionRegistry::new();
    {
        let ran = ran.clone();
        functions.register_blocking("side_effect", move |_| {
            *ran.lock().unwrap() = true;
            Ok(json!(null))
        });
    }
    let api = JobSchedulingAPI::with_functions(&memory_config(), functions).await?;

    let id = api
        .add_job("side_effect", JobArgs::new(), JobOptions::new().run_in(Duration::from_millis(300)))
        .await?;
    assert!(api.cancel_job(id).await?);
    assert!(!api.cancel_job(id).await?);

    api.start_worker_pool(1, true).await?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    api.stop_worker_pool().await?;

    assert!(!*ran.lock().unwrap());
    assert!(matches!(
        api.get_job_result(id, true).await,
        Err(QueueError::JobCancelled { .. })
    ));
    Ok(())
}
