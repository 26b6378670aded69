//! Job scheduling subsystem for jobsmith
//!
//! This module provides:
//! - Ad-hoc jobs, run now, later or synchronously
//! - Recurring schedules driven by cron, interval and date triggers
//! - A worker pool of thread, process or fiber slots
//!
//! The system is built around five main components:
//! - `JobManager`: job submission and result retrieval
//! - `ScheduleRegistry`: schedule CRUD and due-schedule emission
//! - `JobQueueRunner`: leasing and retry-wrapped execution
//! - `SlotExecutor`: the execution slots themselves
//! - `WorkerPool`: start/stop supervision of the above

pub mod api;
pub mod builtin;
pub mod child_process;
pub mod job_executor;
pub mod job_manager;
pub mod job_queue_runner;
pub mod job_scheduler;
pub mod registry;
pub mod types;
pub mod worker_pool;

pub use api::JobSchedulingAPI;
pub use job_executor::{JobCall, SlotExecutor, build_executor};
pub use job_manager::JobManager;
pub use job_queue_runner::{ExecutionStats, JobQueueRunner};
pub use job_scheduler::ScheduleRegistry;
pub use registry::{FunctionRegistry, RunFunction};
pub use types::*;
pub use worker_pool::WorkerPool;
