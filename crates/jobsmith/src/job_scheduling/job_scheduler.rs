//! Schedule registry and emission ticker
//!
//! Schedules are stored in the backend like jobs, so every pool sharing a
//! backend sees the same set. Each firing is claimed on `next_fire_time` and
//! its job enqueued in one backend step, so only one pool emits it and a
//! failed enqueue leaves the firing due.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{ConflictPolicy, JobEvent, JobId, NewSchedule, Schedule, ScheduleStatus};
use crate::backends::JobBackend;
use crate::backends::events::EventBroker;
use crate::config::JobDefaultsConfig;
use crate::errors::{QueueError, QueueResult};

/// Next free `{name}-{n}` id given the ids already taken
pub fn next_schedule_id<'a, I>(name: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{name}-");
    let highest = existing
        .into_iter()
        .filter_map(|id| id.strip_prefix(&prefix))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("{name}-{}", highest + 1)
}

/// CRUD, pause/resume and emission for recurring job definitions
pub struct ScheduleRegistry {
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventBroker>,
    defaults: JobDefaultsConfig,
}

impl ScheduleRegistry {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventBroker>,
        defaults: JobDefaultsConfig,
    ) -> Self {
        Self {
            backend,
            events,
            defaults,
        }
    }

    /// Register a schedule, resolving its id and conflict policy
    pub async fn add_schedule(&self, request: NewSchedule) -> QueueResult<Schedule> {
        self.add_schedule_at(request, Utc::now()).await
    }

    pub async fn add_schedule_at(
        &self,
        request: NewSchedule,
        now: DateTime<Utc>,
    ) -> QueueResult<Schedule> {
        if request.name.trim().is_empty() {
            return Err(QueueError::configuration("schedule name must not be empty"));
        }
        if request.template.function.trim().is_empty() {
            return Err(QueueError::configuration("schedule function must not be empty"));
        }
        if request.repeat == Some(0) {
            return Err(QueueError::configuration("schedule repeat count must be at least 1"));
        }
        if let Some(retry) = &request.template.options.retry {
            retry.validate()?;
        }
        let trigger = request.trigger.resolve(now)?;

        let (id, policy) = if request.overwrite {
            (format!("{}-1", request.name), ConflictPolicy::Replace)
        } else if let Some(id) = request.id.filter(|id| !id.is_empty()) {
            (id, request.conflict_policy)
        } else {
            let existing = self.backend.list_schedules().await?;
            let id = next_schedule_id(&request.name, existing.iter().map(|s| s.id.as_str()));
            (id, ConflictPolicy::Error)
        };

        let next_fire_time = trigger.first_fire_time(now);
        let status = if next_fire_time.is_none() {
            ScheduleStatus::Finished
        } else if request.paused {
            ScheduleStatus::Paused
        } else {
            ScheduleStatus::Active
        };

        let schedule = Schedule {
            id,
            name: request.name,
            trigger,
            template: request.template,
            status,
            conflict_policy: policy,
            created_at: now,
            updated_at: now,
            next_fire_time,
            last_fire_time: None,
            remaining: request.repeat,
        };

        let stored = self
            .backend
            .insert_schedule(&schedule, policy == ConflictPolicy::Replace)
            .await?;
        if !stored {
            match policy {
                ConflictPolicy::DoNothing => {
                    debug!("Schedule {} already exists, keeping it", schedule.id);
                    return self
                        .get_schedule(&schedule.id)
                        .await?
                        .ok_or_else(|| QueueError::schedule_not_found(&schedule.id));
                }
                _ => return Err(QueueError::ScheduleExists { id: schedule.id }),
            }
        }

        info!(
            "Added schedule {} ({} {}), next fire {}",
            schedule.id,
            schedule.template.function,
            schedule.trigger.describe(),
            schedule
                .next_fire_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>> {
        self.backend.get_schedule(id).await
    }

    pub async fn get_schedules(&self) -> QueueResult<Vec<Schedule>> {
        self.backend.list_schedules().await
    }

    async fn require(&self, id: &str) -> QueueResult<Schedule> {
        self.backend
            .get_schedule(id)
            .await?
            .ok_or_else(|| QueueError::schedule_not_found(id))
    }

    /// Stop firing without losing the schedule; `false` unless it was active
    pub async fn pause_schedule(&self, id: &str) -> QueueResult<bool> {
        let schedule = self.require(id).await?;
        self.pause(schedule, Utc::now()).await
    }

    async fn pause(&self, mut schedule: Schedule, now: DateTime<Utc>) -> QueueResult<bool> {
        if schedule.status != ScheduleStatus::Active {
            return Ok(false);
        }
        schedule.status = ScheduleStatus::Paused;
        schedule.updated_at = now;
        let updated = self.backend.update_schedule(&schedule).await?;
        if updated {
            info!("Paused schedule {}", schedule.id);
        }
        Ok(updated)
    }

    /// Resume a paused schedule; the next fire time is computed from now
    pub async fn resume_schedule(&self, id: &str) -> QueueResult<bool> {
        let schedule = self.require(id).await?;
        self.resume(schedule, Utc::now()).await
    }

    async fn resume(&self, mut schedule: Schedule, now: DateTime<Utc>) -> QueueResult<bool> {
        if schedule.status != ScheduleStatus::Paused {
            return Ok(false);
        }
        schedule.next_fire_time = schedule.trigger.first_fire_time(now);
        schedule.status = if schedule.next_fire_time.is_some() {
            ScheduleStatus::Active
        } else {
            ScheduleStatus::Finished
        };
        schedule.updated_at = now;
        let updated = self.backend.update_schedule(&schedule).await?;
        if updated {
            info!("Resumed schedule {} ({})", schedule.id, schedule.status);
        }
        Ok(updated)
    }

    /// Stop all future firings and keep the record as cancelled
    pub async fn cancel_schedule(&self, id: &str) -> QueueResult<bool> {
        let schedule = self.require(id).await?;
        self.cancel(schedule, Utc::now()).await
    }

    async fn cancel(&self, mut schedule: Schedule, now: DateTime<Utc>) -> QueueResult<bool> {
        if matches!(
            schedule.status,
            ScheduleStatus::Cancelled | ScheduleStatus::Finished
        ) {
            return Ok(false);
        }
        schedule.status = ScheduleStatus::Cancelled;
        schedule.next_fire_time = None;
        schedule.updated_at = now;
        let updated = self.backend.update_schedule(&schedule).await?;
        if updated {
            info!("Cancelled schedule {}", schedule.id);
        }
        Ok(updated)
    }

    /// Remove every trace of a schedule; `false` when it does not exist
    pub async fn delete_schedule(&self, id: &str) -> QueueResult<bool> {
        let deleted = self.backend.delete_schedule(id).await?;
        if deleted {
            info!("Deleted schedule {}", id);
        }
        Ok(deleted)
    }

    pub async fn pause_all(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for schedule in self.backend.list_schedules().await? {
            if self.pause(schedule, now).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn resume_all(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for schedule in self.backend.list_schedules().await? {
            if self.resume(schedule, now).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn cancel_all(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for schedule in self.backend.list_schedules().await? {
            if self.cancel(schedule, now).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn delete_all(&self) -> QueueResult<usize> {
        let mut count = 0;
        for schedule in self.backend.list_schedules().await? {
            if self.backend.delete_schedule(&schedule.id).await? {
                count += 1;
            }
        }
        info!("Deleted {} schedules", count);
        Ok(count)
    }

    /// Enqueue one job for every schedule due at `now`
    ///
    /// Missed firings collapse into a single job. Per-schedule failures are
    /// logged and skipped.
    pub async fn emit_due(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut emitted = Vec::new();
        for schedule in self.backend.list_schedules().await? {
            if !schedule.is_due(now) {
                continue;
            }
            match self.fire(&schedule, now).await {
                Ok(Some(job_id)) => emitted.push(job_id),
                Ok(None) => debug!("Schedule {} firing claimed elsewhere", schedule.id),
                Err(e) => warn!("Failed to fire schedule {}: {}", schedule.id, e),
            }
        }
        if !emitted.is_empty() {
            debug!("Emitted {} scheduled jobs", emitted.len());
        }
        Ok(emitted)
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        let Some(expected) = schedule.next_fire_time else {
            return Ok(None);
        };

        let next = schedule.after_firing(now);
        let job = schedule.emit_job(&self.defaults, now);
        let job_id = job.id;
        let channel = job.channel.clone();
        if !self.backend.fire_schedule(&next, expected, job).await? {
            return Ok(None);
        }

        if let Err(e) = self
            .events
            .publish(JobEvent::Enqueued { job_id, channel })
            .await
        {
            warn!("Failed to publish enqueue event for job {}: {}", job_id, e);
        }

        info!(
            "Schedule {} fired job {} (function: {})",
            schedule.id, job_id, schedule.template.function
        );
        if next.status == ScheduleStatus::Finished {
            info!("Schedule {} finished", schedule.id);
        }
        Ok(Some(job_id))
    }

    /// Run the emission ticker until cancelled
    pub async fn run(&self, period: Duration, cancellation_token: CancellationToken) {
        info!("Starting schedule ticker (every {:?})", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.emit_due(Utc::now()).await {
                        error!("Error emitting due schedules: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Schedule ticker received cancellation signal, shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::events::LocalEventBroker;
    use crate::backends::memory::MemoryBackend;
    use crate::job_scheduling::types::{JobFilter, JobState};
    use crate::triggers::TriggerSpec;
    use rstest::rstest;

    fn registry() -> (ScheduleRegistry, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = ScheduleRegistry::new(
            backend.clone(),
            Arc::new(LocalEventBroker::new()),
            JobDefaultsConfig::default(),
        );
        (registry, backend)
    }

    fn every_minute(name: &str) -> NewSchedule {
        NewSchedule::new(name, "echo", TriggerSpec::every(Duration::from_secs(60)))
    }

    async fn jobs_for(backend: &MemoryBackend, schedule_id: &str) -> usize {
        let filter = JobFilter {
            schedule_id: Some(schedule_id.to_string()),
            ..JobFilter::default()
        };
        backend.list_jobs(&filter).await.unwrap().len()
    }

    #[rstest]
    #[case(&[], "etl-1")]
    #[case(&["etl-1", "etl-2"], "etl-3")]
    #[case(&["etl-7", "etl-2"], "etl-8")]
    #[case(&["etl-x", "other-9", "etl-"], "etl-1")]
    fn test_next_schedule_id(#[case] existing: &[&str], #[case] expected: &str) {
        assert_eq!(next_schedule_id("etl", existing.iter().copied()), expected);
    }

    #[tokio::test]
    async fn test_generated_ids_and_overwrite() {
        let (registry, _) = registry();
        assert_eq!(registry.add_schedule(every_minute("etl")).await.unwrap().id, "etl-1");
        assert_eq!(registry.add_schedule(every_minute("etl")).await.unwrap().id, "etl-2");
        assert_eq!(registry.add_schedule(every_minute("etl")).await.unwrap().id, "etl-3");

        let replaced = registry
            .add_schedule(
                NewSchedule::new("etl", "add", TriggerSpec::crontab("0 * * * *")).overwrite(true),
            )
            .await
            .unwrap();
        assert_eq!(replaced.id, "etl-1");
        let stored = registry.get_schedule("etl-1").await.unwrap().unwrap();
        assert_eq!(stored.template.function, "add");
        assert_eq!(registry.get_schedules().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_conflict_policies_for_explicit_ids() {
        let (registry, _) = registry();
        registry
            .add_schedule(every_minute("nightly").id("nightly"))
            .await
            .unwrap();

        let err = registry
            .add_schedule(every_minute("nightly").id("nightly"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ScheduleExists { .. }));

        let kept = registry
            .add_schedule(
                NewSchedule::new("nightly", "add", TriggerSpec::once())
                    .id("nightly")
                    .conflict_policy(ConflictPolicy::DoNothing),
            )
            .await
            .unwrap();
        assert_eq!(kept.template.function, "echo");

        let replaced = registry
            .add_schedule(
                NewSchedule::new("nightly", "add", TriggerSpec::once())
                    .id("nightly")
                    .conflict_policy(ConflictPolicy::Replace),
            )
            .await
            .unwrap();
        assert_eq!(replaced.template.function, "add");
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_fast() {
        let (registry, _) = registry();
        let zero = NewSchedule::new("etl", "echo", TriggerSpec::every(Duration::ZERO));
        assert!(registry.add_schedule(zero).await.unwrap_err().is_configuration());

        let bad_cron = NewSchedule::new("etl", "echo", TriggerSpec::crontab("61 * * * *"));
        assert!(registry.add_schedule(bad_cron).await.unwrap_err().is_configuration());

        let no_repeats = every_minute("etl").repeat(0);
        assert!(registry.add_schedule(no_repeats).await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_paused_schedule_emits_nothing_until_resumed() {
        let (registry, backend) = registry();
        let schedule = registry.add_schedule(every_minute("etl")).await.unwrap();
        assert!(registry.pause_schedule(&schedule.id).await.unwrap());
        assert!(!registry.pause_schedule(&schedule.id).await.unwrap());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(registry.emit_due(later).await.unwrap().is_empty());
        assert_eq!(jobs_for(&backend, &schedule.id).await, 0);
        // Still listed while paused
        assert!(registry.get_schedule(&schedule.id).await.unwrap().unwrap().is_paused());

        assert!(registry.resume_schedule(&schedule.id).await.unwrap());
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(registry.emit_due(later).await.unwrap().len(), 1);
        assert!(registry.emit_due(later).await.unwrap().is_empty());
        assert_eq!(jobs_for(&backend, &schedule.id).await, 1);
    }

    #[tokio::test]
    async fn test_missed_firings_coalesce_into_one_job() {
        let (registry, backend) = registry();
        let schedule = registry.add_schedule(every_minute("etl")).await.unwrap();
        let first = schedule.next_fire_time.unwrap();

        let late = first + chrono::Duration::minutes(10);
        let emitted = registry.emit_due(late).await.unwrap();
        assert_eq!(emitted.len(), 1);

        let job = backend.get_job(emitted[0]).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.schedule_id.as_deref(), Some(schedule.id.as_str()));

        let stored = registry.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fire_time, Some(first));
        assert!(stored.next_fire_time.unwrap() > late);
    }

    #[tokio::test]
    async fn test_repeat_count_and_date_trigger_finish() {
        let (registry, _) = registry();
        let twice = registry
            .add_schedule(every_minute("twice").repeat(2))
            .await
            .unwrap();
        let once = registry
            .add_schedule(NewSchedule::new("once", "echo", TriggerSpec::once()))
            .await
            .unwrap();

        let mut at = Utc::now();
        for _ in 0..3 {
            at += chrono::Duration::minutes(2);
            registry.emit_due(at).await.unwrap();
        }

        let twice = registry.get_schedule(&twice.id).await.unwrap().unwrap();
        assert_eq!(twice.status, ScheduleStatus::Finished);
        assert_eq!(twice.remaining, Some(0));
        let once = registry.get_schedule(&once.id).await.unwrap().unwrap();
        assert_eq!(once.status, ScheduleStatus::Finished);
        assert!(once.next_fire_time.is_none());
    }

    #[tokio::test]
    async fn test_cancel_keeps_record_and_delete_is_idempotent() {
        let (registry, _) = registry();
        let schedule = registry.add_schedule(every_minute("etl")).await.unwrap();

        assert!(registry.cancel_schedule(&schedule.id).await.unwrap());
        assert!(!registry.cancel_schedule(&schedule.id).await.unwrap());
        let stored = registry.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
        assert!(!registry.resume_schedule(&schedule.id).await.unwrap());

        assert!(registry.delete_schedule(&schedule.id).await.unwrap());
        assert!(!registry.delete_schedule(&schedule.id).await.unwrap());
        assert!(matches!(
            registry.pause_schedule(&schedule.id).await,
            Err(QueueError::ScheduleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let (registry, _) = registry();
        for _ in 0..3 {
            registry.add_schedule(every_minute("etl")).await.unwrap();
        }
        assert_eq!(registry.pause_all().await.unwrap(), 3);
        assert_eq!(registry.pause_all().await.unwrap(), 0);
        assert_eq!(registry.resume_all().await.unwrap(), 3);
        assert_eq!(registry.cancel_all().await.unwrap(), 3);
        assert_eq!(registry.delete_all().await.unwrap(), 3);
        assert!(registry.get_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_emitters_fire_once() {
        let (registry, backend) = registry();
        let registry = Arc::new(registry);
        let schedule = registry.add_schedule(every_minute("etl")).await.unwrap();
        let at = schedule.next_fire_time.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.emit_due(at).await.unwrap().len() })
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1);
        assert_eq!(jobs_for(&backend, &schedule.id).await, 1);
    }

    /// Event layer that rejects every notification
    struct DroppedEvents(tokio::sync::broadcast::Sender<JobEvent>);

    #[async_trait::async_trait]
    impl EventBroker for DroppedEvents {
        async fn publish(&self, _event: JobEvent) -> QueueResult<()> {
            Err(QueueError::backend("notification channel closed"))
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
            self.0.subscribe()
        }
    }

    #[tokio::test]
    async fn test_fired_job_is_reported_when_notification_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let (sender, _) = tokio::sync::broadcast::channel(4);
        let registry = ScheduleRegistry::new(
            backend.clone(),
            Arc::new(DroppedEvents(sender)),
            JobDefaultsConfig::default(),
        );
        let schedule = registry
            .add_schedule(NewSchedule::new("once", "echo", TriggerSpec::once()))
            .await
            .unwrap();

        let emitted = registry.emit_due(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(emitted.len(), 1);
        let job = backend.get_job(emitted[0]).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(
            registry.get_schedule(&schedule.id).await.unwrap().unwrap().status,
            ScheduleStatus::Finished
        );
    }
}
