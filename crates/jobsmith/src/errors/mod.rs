//! Centralized error handling for jobsmith
//!
//! Every fallible operation in the crate returns [`QueueError`]. Run functions
//! report failures as [`JobError`], a plain serializable value that survives
//! storage in any backend and the trip across a worker process boundary.
//!
//! # Error Categories
//!
//! - **Configuration Errors**: bad backend type, missing connection fields,
//!   invalid trigger specifications. Raised at construction, never retried.
//! - **Backend Errors**: database or broker failures during an operation
//! - **Unsupported Operations**: an operation the selected backend cannot honour
//! - **Job Errors**: terminal failures recorded on a job

pub mod types;

pub use types::*;

/// Convenience type alias for Results using QueueError
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type returned by run functions
pub type JobOutcome = Result<serde_json::Value, JobError>;
