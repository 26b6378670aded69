//! Built-in run functions
//!
//! Served by `jobsmith worker` and by process-pool children, so a queue can be
//! exercised end to end without application code.

use serde_json::{Value, json};
use std::time::Duration;

use super::registry::FunctionRegistry;
use super::types::JobArgs;
use crate::errors::JobError;

fn number(value: &Value) -> Result<f64, JobError> {
    value
        .as_f64()
        .ok_or_else(|| JobError::new("ValueError", format!("expected a number, got {value}")))
}

/// Register the functions that are safe in any worker kind
pub fn register_builtins(registry: &FunctionRegistry) {
    registry.register_blocking("echo", |args: JobArgs| {
        Ok(json!({ "args": args.args, "kwargs": args.kwargs }))
    });

    registry.register_blocking("add", |args: JobArgs| {
        let mut total = 0.0;
        for value in args.args.iter().chain(args.kwargs.values()) {
            total += number(value)?;
        }
        Ok(json!(total))
    });

    registry.register_async("sleep", |args: JobArgs| async move {
        let seconds = match args.get("seconds", 0) {
            Some(v) => number(v)?,
            None => 1.0,
        };
        let delay = Duration::try_from_secs_f64(seconds)
            .map_err(|e| JobError::new("ValueError", e.to_string()))?;
        tokio::time::sleep(delay).await;
        Ok(json!(seconds))
    });

    registry.register_blocking("fail", |args: JobArgs| {
        let kind = args
            .get("kind", 0)
            .and_then(Value::as_str)
            .unwrap_or("TransientError");
        let message = args
            .get("message", 1)
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        Err(JobError::new(kind, message))
    });

    registry.register_blocking("panic", |_| panic!("requested panic"));
}

/// Register process-only functions on top of [`register_builtins`]
///
/// `crash` exits the process mid-job, which only makes sense inside a child.
pub fn register_child_builtins(registry: &FunctionRegistry) {
    register_builtins(registry);
    registry.register_blocking("crash", |args: JobArgs| {
        let code = args.get("code", 0).and_then(Value::as_i64).unwrap_or(3);
        std::process::exit(i32::try_from(code).unwrap_or(3))
    });
    registry.register_blocking("pid", |_| Ok(json!(std::process::id())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_fail() {
        let registry = FunctionRegistry::new();
        register_builtins(&registry);

        assert_eq!(registry.call("add", JobArgs::positional([40, 2])).await, Ok(json!(42.0)));
        let err = registry
            .call("add", JobArgs::positional([json!("x")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "ValueError");

        let err = registry
            .call("fail", JobArgs::new().kwarg("kind", "TransientError"))
            .await
            .unwrap_err();
        assert_eq!(err, JobError::new("TransientError", "requested failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_duration() {
        let registry = FunctionRegistry::new();
        register_builtins(&registry);
        assert_eq!(registry.call("sleep", JobArgs::positional([2])).await, Ok(json!(2.0)));
    }
}
