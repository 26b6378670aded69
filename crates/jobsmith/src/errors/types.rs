//! Error type definitions for jobsmith

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for queue, schedule and worker operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Invalid configuration detected before any work is attempted
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The selected backend cannot perform the requested operation
    #[error("Unsupported operation: {operation} is not supported by the {backend} backend")]
    Unsupported { operation: String, backend: String },

    /// Database-related errors (SeaORM)
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Message broker errors
    #[cfg(feature = "redis")]
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// Backend failures that carry no richer type
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Payload serialization/deserialization failures
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Schedule already exists: {id}")]
    ScheduleExists { id: String },

    /// A job reached the failed state; the original run-function error is kept intact
    #[error("Job {job_id} failed: {error}")]
    JobFailed { job_id: String, error: JobError },

    #[error("Job {job_id} was cancelled")]
    JobCancelled { job_id: String },

    #[error("Worker pool is already running")]
    WorkerPoolRunning,

    /// Worker slot failures (spawn errors, broken child pipes)
    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported<O: Into<String>, B: Into<String>>(operation: O, backend: B) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    pub fn job_not_found<S: ToString>(id: S) -> Self {
        Self::JobNotFound { id: id.to_string() }
    }

    pub fn schedule_not_found<S: Into<String>>(id: S) -> Self {
        Self::ScheduleNotFound { id: id.into() }
    }

    /// Whether the error was raised by configuration validation
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<figment::Error> for QueueError {
    fn from(err: figment::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Error reported by a run function
///
/// `kind` is a short classifier such as `TransientError` that retry policies
/// match against; `message` is free-form detail.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl JobError {
    /// Error kind recorded when a run function panics
    pub const PANIC: &'static str = "Panic";
    /// Error kind recorded when a worker process dies mid-job
    pub const WORKER_CRASHED: &'static str = "WorkerCrashed";
    /// Error kind recorded when no run function is registered under the job's name
    pub const UNKNOWN_FUNCTION: &'static str = "UnknownFunction";

    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn panic<M: Into<String>>(message: M) -> Self {
        Self::new(Self::PANIC, message)
    }

    pub fn worker_crashed<M: Into<String>>(message: M) -> Self {
        Self::new(Self::WORKER_CRASHED, message)
    }

    pub fn unknown_function(name: &str) -> Self {
        Self::new(
            Self::UNKNOWN_FUNCTION,
            format!("no run function registered as '{name}'"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message_names_operation_and_backend() {
        let err = QueueError::unsupported("cancel running job", "sqlite");
        assert_eq!(
            err.to_string(),
            "Unsupported operation: cancel running job is not supported by the sqlite backend"
        );
    }

    #[test]
    fn test_job_failed_keeps_original_error() {
        let original = JobError::new("TransientError", "upstream timed out");
        let err = QueueError::JobFailed {
            job_id: "abc".to_string(),
            error: original.clone(),
        };
        match err {
            QueueError::JobFailed { error, .. } => assert_eq!(error, original),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_job_error_serializes_as_plain_object() {
        let err = JobError::new("ValueError", "bad input");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "ValueError");
        assert_eq!(json["message"], "bad input");
    }
}
