//! Trigger engine
//!
//! Turns caller-supplied timing ([`TriggerSpec`]) into a storable [`Trigger`]
//! and computes fire times from it. Everything here is pure: the current time
//! is always passed in.

pub mod cron;
pub mod describe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_serde;
use crate::errors::{QueueError, QueueResult};

pub use self::cron::{CronExpression, CronFields, CronSpec, day_of_week_name, day_of_week_number};
pub use describe::describe_cron;

/// Structured interval; all parts are added together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(default)]
    pub weeks: u64,
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl IntervalSpec {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn total(&self) -> Duration {
        let secs = self
            .weeks
            .saturating_mul(7 * 24 * 3600)
            .saturating_add(self.days.saturating_mul(24 * 3600))
            .saturating_add(self.hours.saturating_mul(3600))
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.seconds);
        Duration::from_secs(secs)
    }
}

/// Timing as supplied by a caller, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerSpec {
    Cron(CronSpec),
    Interval(IntervalSpec),
    /// Fires once; `None` means as soon as possible
    Date { at: Option<DateTime<Utc>> },
}

impl TriggerSpec {
    pub fn crontab<S: Into<String>>(expr: S) -> Self {
        Self::Cron(CronSpec::crontab(expr))
    }

    /// Interval trigger from a whole-second duration
    pub fn every(period: Duration) -> Self {
        Self::Interval(IntervalSpec::seconds(period.as_secs()))
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self::Date { at: Some(at) }
    }

    pub fn once() -> Self {
        Self::Date { at: None }
    }

    /// Validate and pin the spec down to a concrete trigger
    pub fn resolve(&self, now: DateTime<Utc>) -> QueueResult<Trigger> {
        match self {
            TriggerSpec::Cron(spec) => Ok(Trigger::Cron(CronExpression::resolve(spec)?)),
            TriggerSpec::Interval(spec) => {
                let every = spec.total();
                if every.is_zero() {
                    return Err(QueueError::configuration("interval trigger must be non-zero"));
                }
                Ok(Trigger::Interval { every, start: now })
            }
            TriggerSpec::Date { at } => Ok(Trigger::Date {
                at: at.unwrap_or(now),
            }),
        }
    }
}

/// A resolved trigger, stored on its schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trigger {
    Cron(CronExpression),
    /// Fires at `start + k * every` for k >= 1
    Interval {
        #[serde(with = "duration_serde::duration")]
        every: Duration,
        start: DateTime<Utc>,
    },
    Date { at: DateTime<Utc> },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron(_) => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::Date { .. } => "date",
        }
    }

    /// Next fire time strictly after `after`; `None` when the trigger is exhausted
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(expr) => expr.next_after(after),
            Trigger::Interval { every, start } => {
                let every_ms = i64::try_from(every.as_millis()).ok()?.max(1);
                let elapsed_ms = (after - *start).num_milliseconds();
                let periods = if elapsed_ms < 0 {
                    1
                } else {
                    elapsed_ms / every_ms + 1
                };
                let offset = periods.checked_mul(every_ms)?;
                start.checked_add_signed(chrono::Duration::milliseconds(offset))
            }
            Trigger::Date { at } => (*at > after).then_some(*at),
        }
    }

    /// Initial fire time for a schedule created or resumed at `now`
    ///
    /// A date trigger keeps its time even when it has already passed, so it
    /// fires as soon as it is picked up.
    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date { at } => Some(*at),
            other => other.next_fire_time(now),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Cron(expr) => describe_cron(expr).unwrap_or_else(|_| expr.to_string()),
            Trigger::Interval { every, .. } => {
                format!("every {}", humantime::format_duration(*every))
            }
            Trigger::Date { at } => format!("once at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        }
    }
}
