//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::config::{JobDefaultsConfig, duration_serde};
use crate::errors::{JobError, QueueError, QueueResult};
use crate::triggers::{Trigger, TriggerSpec};

pub use crate::utils::retry::RetryPolicy;

/// Opaque job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| QueueError::configuration(format!("invalid job id '{s}': {e}")))
    }
}

/// Job lifecycle: `Pending -> Running -> {Succeeded, Failed, Cancelled}`, or `Pending -> Cancelled`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// Concurrency kind of a worker pool's execution slots
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WorkerKind {
    /// OS threads in this process, sharing memory
    #[default]
    Thread,
    /// OS child processes, one per slot, talking JSON lines over stdio
    Process,
    /// Cooperative tasks on a single OS thread
    Fiber,
}

/// Positional and keyword arguments handed to a run function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    pub fn arg<V: Into<Value>>(mut self, value: V) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Keyword argument if present, else the positional one at `index`
    pub fn get(&self, key: &str, index: usize) -> Option<&Value> {
        self.kwargs.get(key).or_else(|| self.args.get(index))
    }
}

/// Per-call job options; unset fields fall through to the template, then to system defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub result_ttl: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Absolute start time; wins over `run_in`
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub run_in: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn run_in(mut self, delay: Duration) -> Self {
        self.run_in = Some(delay);
        self
    }

    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: &JobOptions) -> JobOptions {
        JobOptions {
            channel: self.channel.or_else(|| fallback.channel.clone()),
            result_ttl: self.result_ttl.or(fallback.result_ttl),
            retry: self.retry.or_else(|| fallback.retry.clone()),
            run_at: self.run_at.or(fallback.run_at),
            run_in: self.run_in.or(fallback.run_in),
        }
    }

    /// When the job becomes eligible; `None` means immediately
    pub fn scheduled_for(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.run_at, self.run_in) {
            (Some(at), _) => Some(at),
            (None, Some(delay)) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            (None, None) => None,
        }
    }

    /// Final tier: system defaults
    pub fn resolve(&self, defaults: &JobDefaultsConfig) -> ResolvedJobOptions {
        ResolvedJobOptions {
            channel: self.channel.clone().unwrap_or_else(|| defaults.channel.clone()),
            result_ttl: self.result_ttl.unwrap_or(defaults.result_ttl),
            retry: self.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
        }
    }
}

/// Job options with every tier applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJobOptions {
    pub channel: String,
    pub result_ttl: Duration,
    pub retry: RetryPolicy,
}

/// A unit of work owned by the backend once submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the run function in the function registry
    pub function: String,
    pub args: JobArgs,
    pub channel: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(with = "duration_serde::duration")]
    pub result_ttl: Duration,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub leased_by: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the stored outcome may be purged
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        function: impl Into<String>,
        args: JobArgs,
        options: ResolvedJobOptions,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            function: function.into(),
            args,
            channel: options.channel,
            state: JobState::Pending,
            created_at: now,
            scheduled_for,
            result_ttl: options.result_ttl,
            retry: options.retry,
            attempts: 0,
            result: None,
            error: None,
            schedule_id: None,
            leased_by: None,
            started_at: None,
            finished_at: None,
            expires_at: None,
        }
    }

    /// Lease order within a channel: readiness, then submission
    pub fn queue_key(&self) -> (DateTime<Utc>, DateTime<Utc>, JobId) {
        (self.ready_at(), self.created_at, self.id)
    }

    /// Earliest time the job may be leased
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.scheduled_for.unwrap_or(self.created_at)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at() <= now
    }

    /// Apply a lease: the job starts running on `worker_id`
    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.leased_by = Some(worker_id.to_string());
        self.started_at = Some(now);
    }

    /// Apply a terminal outcome and compute result expiry
    pub fn finish(&mut self, outcome: &JobCompletion, now: DateTime<Utc>) {
        match outcome {
            JobCompletion::Succeeded(value) => {
                self.state = JobState::Succeeded;
                self.result = Some(value.clone());
                self.error = None;
            }
            JobCompletion::Failed(error) => {
                self.state = JobState::Failed;
                self.error = Some(error.clone());
            }
        }
        self.finished_at = Some(now);
        self.expires_at = self.expiry_from(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.finished_at = Some(now);
        self.expires_at = self.expiry_from(now);
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.result_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
    }

    /// Terminal outcome as seen by a caller waiting on the result
    pub fn outcome(&self) -> QueueResult<JobResult> {
        match self.state {
            JobState::Pending | JobState::Running => Ok(JobResult::NotReady),
            JobState::Succeeded => Ok(JobResult::Value(self.result.clone().unwrap_or(Value::Null))),
            JobState::Failed => Err(QueueError::JobFailed {
                job_id: self.id.to_string(),
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| JobError::new("Unknown", "job failed without an error")),
            }),
            JobState::Cancelled => Err(QueueError::JobCancelled {
                job_id: self.id.to_string(),
            }),
        }
    }
}

/// Outcome reported by the worker pool for a leased job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobCompletion {
    Succeeded(Value),
    Failed(JobError),
}

impl From<Result<Value, JobError>> for JobCompletion {
    fn from(result: Result<Value, JobError>) -> Self {
        match result {
            Ok(value) => JobCompletion::Succeeded(value),
            Err(error) => JobCompletion::Failed(error),
        }
    }
}

/// Result lookup without blocking
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// The job has not reached a terminal state
    NotReady,
    Value(Value),
}

impl JobResult {
    pub fn into_value(self) -> Option<Value> {
        match self {
            JobResult::NotReady => None,
            JobResult::Value(v) => Some(v),
        }
    }
}

/// Filter for job listings
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub channel: Option<String>,
    pub schedule_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state)
            && self.channel.as_deref().is_none_or(|c| c == job.channel)
            && self
                .schedule_id
                .as_deref()
                .is_none_or(|id| job.schedule_id.as_deref() == Some(id))
    }
}

/// Events broadcast as jobs change state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued { job_id: JobId, channel: String },
    Finished { job_id: JobId, state: JobState },
    Cancelled { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Finished { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }
}

/// What to do when a schedule id is already taken
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictPolicy {
    Replace,
    DoNothing,
    #[default]
    Error,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Cancelled,
    /// No further fire times, or repeats exhausted
    Finished,
}

/// Function, arguments and options a schedule stamps onto every job it emits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub function: String,
    #[serde(default)]
    pub args: JobArgs,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobTemplate {
    pub fn new<S: Into<String>>(function: S) -> Self {
        Self {
            function: function.into(),
            ..Self::default()
        }
    }
}

/// A recurring job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// Pipeline name the id was generated from
    pub name: String,
    pub trigger: Trigger,
    pub template: JobTemplate,
    pub status: ScheduleStatus,
    pub conflict_policy: ConflictPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fire_time: Option<DateTime<Utc>>,
    /// Firings left; `None` repeats forever
    pub remaining: Option<u32>,
}

impl Schedule {
    pub fn is_paused(&self) -> bool {
        self.status == ScheduleStatus::Paused
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active && self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Stored state once the firing due at `next_fire_time` is taken at `now`
    ///
    /// The next fire time is computed from `now`, so missed firings collapse.
    pub fn after_firing(&self, now: DateTime<Utc>) -> Schedule {
        let mut next = self.clone();
        next.last_fire_time = self.next_fire_time;
        next.next_fire_time = self.trigger.next_fire_time(now);
        next.remaining = self.remaining.map(|n| n.saturating_sub(1));
        if next.remaining == Some(0) {
            next.next_fire_time = None;
        }
        if next.next_fire_time.is_none() {
            next.status = ScheduleStatus::Finished;
        }
        next.updated_at = now;
        next
    }

    /// Job emitted for one firing, with template options resolved against defaults
    pub fn emit_job(&self, defaults: &JobDefaultsConfig, now: DateTime<Utc>) -> Job {
        let options = self.template.options.resolve(defaults);
        let mut job = Job::new(
            self.template.function.clone(),
            self.template.args.clone(),
            options,
            None,
            now,
        );
        job.schedule_id = Some(self.id.clone());
        job
    }
}

/// Request to register a schedule
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub id: Option<String>,
    pub name: String,
    pub trigger: TriggerSpec,
    pub template: JobTemplate,
    pub conflict_policy: ConflictPolicy,
    /// Always use `{name}-1`, replacing whatever is stored there
    pub overwrite: bool,
    pub repeat: Option<u32>,
    pub paused: bool,
}

impl NewSchedule {
    pub fn new<N: Into<String>, F: Into<String>>(name: N, function: F, trigger: TriggerSpec) -> Self {
        Self {
            id: None,
            name: name.into(),
            trigger,
            template: JobTemplate::new(function),
            conflict_policy: ConflictPolicy::default(),
            overwrite: false,
            repeat: None,
            paused: false,
        }
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn args(mut self, args: JobArgs) -> Self {
        self.template.args = args;
        self
    }

    pub fn options(mut self, options: JobOptions) -> Self {
        self.template.options = options;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn repeat(mut self, times: u32) -> Self {
        self.repeat = Some(times);
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_run_at_beats_run_in() {
        let at = now() + chrono::Duration::hours(2);
        let opts = JobOptions::new().run_in(Duration::from_secs(5)).run_at(at);
        assert_eq!(opts.scheduled_for(now()), Some(at));

        let delayed = JobOptions::new().run_in(Duration::from_secs(5));
        assert_eq!(delayed.scheduled_for(now()), Some(now() + chrono::Duration::seconds(5)));

        assert_eq!(JobOptions::new().scheduled_for(now()), None);
    }

    #[test]
    fn test_three_tier_resolution() {
        let defaults = JobDefaultsConfig::default();
        let template = JobOptions::new()
            .channel("reports")
            .result_ttl(Duration::from_secs(60));
        let call = JobOptions::new().result_ttl(Duration::from_secs(5));

        let resolved = call.or(&template).resolve(&defaults);
        assert_eq!(resolved.channel, "reports");
        assert_eq!(resolved.result_ttl, Duration::from_secs(5));
        assert_eq!(resolved.retry, defaults.retry);
    }

    #[test]
    fn test_outcome_per_state() {
        let defaults = JobDefaultsConfig::default();
        let mut job = Job::new("f", JobArgs::new(), JobOptions::new().resolve(&defaults), None, now());
        assert_eq!(job.outcome().unwrap(), JobResult::NotReady);

        job.finish(&JobCompletion::Failed(JobError::new("TransientError", "boom")), now());
        match job.outcome() {
            Err(QueueError::JobFailed { error, .. }) => assert_eq!(error.kind, "TransientError"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(job.expires_at, Some(now() + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_state_and_kind_parsing() {
        assert_eq!("running".parse::<JobState>().unwrap(), JobState::Running);
        assert_eq!(JobState::Cancelled.to_string(), "cancelled");
        assert_eq!("Process".parse::<WorkerKind>().unwrap(), WorkerKind::Process);
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_job_args_lookup_prefers_kwargs() {
        let args = JobArgs::positional([1, 2]).kwarg("b", 20);
        assert_eq!(args.get("a", 0), Some(&Value::from(1)));
        assert_eq!(args.get("b", 1), Some(&Value::from(20)));
        assert_eq!(args.get("c", 5), None);
    }
}
