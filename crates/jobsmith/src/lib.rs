pub mod backends;
pub mod config;
pub mod database;
pub mod entities;
pub mod errors;
pub mod job_scheduling;
pub mod triggers;
pub mod utils;

pub use config::Config;
pub use errors::{JobError, JobOutcome, QueueError, QueueResult};
pub use job_scheduling::JobSchedulingAPI;
