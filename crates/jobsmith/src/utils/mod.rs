//! Utility modules shared by the queue, scheduler and worker pool

pub mod jitter;
pub mod logging;
pub mod retry;

pub use retry::{RetryPolicy, compute_delay, execute_with_retry};
