//! Five-field cron expressions
//!
//! Fields follow crontab conventions: `minute hour day month day_of_week`, each
//! one `*`, a number, a name, a range `a-b`, a step `*/n` or `a-b/n`, or a
//! comma-separated list of those. Day-of-week accepts 0-7 (0 and 7 are Sunday)
//! or English names; month accepts 1-12 or English names. Names are
//! case-insensitive. When both day fields are restricted, both must match.
//!
//! Next-fire computation is delegated to the `cron` crate. Each field is
//! expanded to its explicit value set first, so the crate only ever sees plain
//! numeric lists and never has to agree with crontab on numbering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::{QueueError, QueueResult};

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Which of the five positions a field occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    Day,
    Month,
    DayOfWeek,
}

impl CronField {
    pub const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::Day,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::Day => "day",
            CronField::Month => "month",
            CronField::DayOfWeek => "day_of_week",
        }
    }

    /// Inclusive bounds accepted in expressions
    fn bounds(self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::Day => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 7),
        }
    }

    fn lookup_name(self, token: &str) -> Option<u32> {
        match self {
            CronField::DayOfWeek => day_of_week_number(token),
            CronField::Month => month_number(token),
            _ => None,
        }
    }

    fn parse_value(self, token: &str) -> QueueResult<u32> {
        let (min, max) = self.bounds();
        let value = match token.parse::<u32>() {
            Ok(n) => n,
            Err(_) => self.lookup_name(token).ok_or_else(|| {
                QueueError::configuration(format!(
                    "invalid value '{token}' in cron {} field",
                    self.name()
                ))
            })?,
        };
        if value < min || value > max {
            return Err(QueueError::configuration(format!(
                "cron {} value {value} is outside {min}-{max}",
                self.name()
            )));
        }
        Ok(value)
    }
}

/// Look up a weekday by number (0-7, Sunday = 0 and 7) or English name
///
/// Full names and three-letter abbreviations are accepted in any case.
pub fn day_of_week_number(token: &str) -> Option<u32> {
    let token = token.trim();
    if let Ok(n) = token.parse::<u32>() {
        return (n <= 7).then_some(n % 7);
    }
    let lower = token.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| {
            let name = name.to_ascii_lowercase();
            lower == name || (lower.len() == 3 && name.starts_with(&lower))
        })
        .map(|idx| idx as u32)
}

/// English name of a weekday given by number or name, see [`day_of_week_number`]
pub fn day_of_week_name(token: &str) -> Option<&'static str> {
    day_of_week_number(token).map(|n| DAY_NAMES[n as usize])
}

fn month_number(token: &str) -> Option<u32> {
    let lower = token.trim().to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .position(|name| {
            let name = name.to_ascii_lowercase();
            lower == name || (lower.len() == 3 && name.starts_with(&lower))
        })
        .map(|idx| idx as u32 + 1)
}

pub(crate) fn month_name(month: u32) -> &'static str {
    MONTH_NAMES[(month.clamp(1, 12) - 1) as usize]
}

pub(crate) fn weekday_name(day: u32) -> &'static str {
    DAY_NAMES[(day % 7) as usize]
}

/// Left-hand side of a field item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Base {
    Any,
    Value(u32),
    Range(u32, u32),
}

/// One comma-separated element of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldItem {
    pub base: Base,
    pub step: Option<u32>,
}

impl FieldItem {
    fn values(&self, field: CronField) -> BTreeSet<u32> {
        let (min, max) = field.bounds();
        let (start, end) = match self.base {
            Base::Any => (min, max),
            // `5/15` in crontab means "from 5 to the end, every 15"
            Base::Value(v) if self.step.is_some() => (v, max),
            Base::Value(v) => (v, v),
            Base::Range(a, b) => (a, b),
        };
        let step = self.step.unwrap_or(1) as usize;
        let mut set: BTreeSet<u32> = (start..=end).step_by(step).collect();
        if field == CronField::DayOfWeek {
            // 7 is an alias for Sunday
            if set.remove(&7) {
                set.insert(0);
            }
        }
        set
    }
}

/// Parse one field into its items, validating bounds
pub(crate) fn parse_field(field: CronField, text: &str) -> QueueResult<Vec<FieldItem>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(QueueError::configuration(format!(
            "cron {} field is empty",
            field.name()
        )));
    }

    text.split(',')
        .map(|part| {
            let (base_text, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step.parse().map_err(|_| {
                        QueueError::configuration(format!(
                            "invalid step '{step}' in cron {} field",
                            field.name()
                        ))
                    })?;
                    if step == 0 {
                        return Err(QueueError::configuration(format!(
                            "step must be at least 1 in cron {} field",
                            field.name()
                        )));
                    }
                    (base, Some(step))
                }
                None => (part, None),
            };

            let base = if base_text == "*" {
                Base::Any
            } else if let Some((a, b)) = base_text.split_once('-') {
                let start = field.parse_value(a)?;
                let end = field.parse_value(b)?;
                if start > end {
                    return Err(QueueError::configuration(format!(
                        "range {base_text} in cron {} field runs backwards",
                        field.name()
                    )));
                }
                Base::Range(start, end)
            } else {
                Base::Value(field.parse_value(base_text)?)
            };

            Ok(FieldItem { base, step })
        })
        .collect()
}

/// Optional discrete cron fields, or a crontab string, as supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    pub minute: Option<String>,
    pub hour: Option<String>,
    pub day: Option<String>,
    pub month: Option<String>,
    pub day_of_week: Option<String>,
    pub crontab: Option<String>,
}

impl CronSpec {
    pub fn crontab<S: Into<String>>(expr: S) -> Self {
        Self {
            crontab: Some(expr.into()),
            ..Self::default()
        }
    }

    fn has_discrete_fields(&self) -> bool {
        self.minute.is_some()
            || self.hour.is_some()
            || self.day.is_some()
            || self.month.is_some()
            || self.day_of_week.is_some()
    }
}

/// The five fields as text, the persisted form of a [`CronExpression`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronFields {
    pub minute: String,
    pub hour: String,
    pub day: String,
    pub month: String,
    pub day_of_week: String,
}

/// A validated five-field cron expression
///
/// The translated schedule is built once when the expression is parsed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "CronFields", into = "CronFields")]
pub struct CronExpression {
    fields: CronFields,
    schedule: cron::Schedule,
}

impl CronExpression {
    /// Resolve either the crontab string or the discrete fields; both is an error
    pub fn resolve(spec: &CronSpec) -> QueueResult<Self> {
        match (&spec.crontab, spec.has_discrete_fields()) {
            (Some(_), true) => Err(QueueError::configuration(
                "cron trigger takes either a crontab string or discrete fields, not both",
            )),
            (Some(crontab), false) => crontab.parse(),
            (None, _) => {
                let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "*".to_string());
                Self::from_fields(
                    field(&spec.minute),
                    field(&spec.hour),
                    field(&spec.day),
                    field(&spec.month),
                    field(&spec.day_of_week),
                )
            }
        }
    }

    pub fn from_fields(
        minute: String,
        hour: String,
        day: String,
        month: String,
        day_of_week: String,
    ) -> QueueResult<Self> {
        CronFields {
            minute: minute.trim().to_string(),
            hour: hour.trim().to_string(),
            day: day.trim().to_string(),
            month: month.trim().to_string(),
            day_of_week: day_of_week.trim().to_string(),
        }
        .try_into()
    }

    pub fn field(&self, field: CronField) -> &str {
        self.fields.get(field)
    }

    pub(crate) fn items(&self, field: CronField) -> QueueResult<Vec<FieldItem>> {
        self.fields.items(field)
    }

    /// The translated schedule in the seconds-first form of the `cron` crate
    pub fn schedule(&self) -> &cron::Schedule {
        &self.schedule
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl CronFields {
    fn get(&self, field: CronField) -> &str {
        match field {
            CronField::Minute => &self.minute,
            CronField::Hour => &self.hour,
            CronField::Day => &self.day,
            CronField::Month => &self.month,
            CronField::DayOfWeek => &self.day_of_week,
        }
    }

    fn items(&self, field: CronField) -> QueueResult<Vec<FieldItem>> {
        parse_field(field, self.get(field))
    }

    fn expanded(&self, field: CronField) -> QueueResult<String> {
        let items = self.items(field)?;
        if items.iter().all(|item| item.base == Base::Any && item.step.is_none()) {
            return Ok("*".to_string());
        }
        let values: BTreeSet<u32> = items.iter().flat_map(|item| item.values(field)).collect();
        let rendered: Vec<String> = values
            .into_iter()
            .map(|v| match field {
                // The cron crate numbers weekdays 1-7 starting at Sunday
                CronField::DayOfWeek => (v + 1).to_string(),
                _ => v.to_string(),
            })
            .collect();
        Ok(rendered.join(","))
    }

    /// Translate to the seconds-first form understood by the `cron` crate
    fn translate(&self) -> QueueResult<cron::Schedule> {
        let translated = format!(
            "0 {} {} {} {} {}",
            self.expanded(CronField::Minute)?,
            self.expanded(CronField::Hour)?,
            self.expanded(CronField::Day)?,
            self.expanded(CronField::Month)?,
            self.expanded(CronField::DayOfWeek)?,
        );
        cron::Schedule::from_str(&translated).map_err(|e| {
            QueueError::configuration(format!("Invalid cron expression '{self}': {e}"))
        })
    }
}

impl TryFrom<CronFields> for CronExpression {
    type Error = QueueError;

    fn try_from(fields: CronFields) -> Result<Self, Self::Error> {
        let schedule = fields.translate()?;
        Ok(Self { fields, schedule })
    }
}

impl From<CronExpression> for CronFields {
    fn from(expr: CronExpression) -> Self {
        expr.fields
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for CronExpression {}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.to_string()).finish()
    }
}

impl FromStr for CronExpression {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        match parts.as_slice() {
            [minute, hour, day, month, dow] => Self::from_fields(
                minute.to_string(),
                hour.to_string(),
                day.to_string(),
                month.to_string(),
                dow.to_string(),
            ),
            _ => Err(QueueError::configuration(format!(
                "crontab '{s}' must have exactly 5 fields, found {}",
                parts.len()
            ))),
        }
    }
}

impl fmt::Display for CronFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, self.day_of_week
        )
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fields.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_fifteen_minutes_is_evenly_spaced() {
        let expr: CronExpression = "*/15 * * * *".parse().unwrap();
        let mut cursor = at(2025, 3, 1, 10, 7);
        let mut fires = Vec::new();
        for _ in 0..8 {
            cursor = expr.next_after(cursor).unwrap();
            fires.push(cursor);
        }
        assert_eq!(fires[0], at(2025, 3, 1, 10, 15));
        for pair in fires.windows(2) {
            assert_eq!(pair[1] - pair[0], chrono::Duration::minutes(15));
        }
    }

    #[test]
    fn test_next_is_strictly_after() {
        let expr: CronExpression = "30 9 * * *".parse().unwrap();
        let now = at(2025, 3, 1, 9, 30);
        assert_eq!(expr.next_after(now), Some(at(2025, 3, 2, 9, 30)));
    }

    #[test]
    fn test_sunday_is_zero_and_seven() {
        let zero: CronExpression = "0 12 * * 0".parse().unwrap();
        let seven: CronExpression = "0 12 * * 7".parse().unwrap();
        let start = at(2025, 3, 3, 0, 0); // a Monday
        let next = zero.next_after(start).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(seven.next_after(start), Some(next));
    }

    #[test]
    fn test_weekday_range_and_names() {
        let numeric: CronExpression = "0 9 * * 1-5".parse().unwrap();
        let named: CronExpression = "0 9 * * MON-fri".parse().unwrap();
        let mut cursor = at(2025, 3, 1, 0, 0); // a Saturday
        for _ in 0..10 {
            let next = numeric.next_after(cursor).unwrap();
            assert_eq!(named.next_after(cursor), Some(next));
            assert!(!matches!(next.weekday(), Weekday::Sat | Weekday::Sun));
            assert_eq!((next.hour(), next.minute()), (9, 0));
            cursor = next;
        }
    }

    #[test]
    fn test_month_names_are_case_insensitive() {
        let expr: CronExpression = "0 0 1 Jan,JUL *".parse().unwrap();
        let next = expr.next_after(at(2025, 2, 1, 0, 0)).unwrap();
        assert_eq!((next.month(), next.day()), (7, 1));
    }

    #[test]
    fn test_stepped_value_runs_to_end_of_range() {
        let expr: CronExpression = "5/20 * * * *".parse().unwrap();
        let first = expr.next_after(at(2025, 1, 1, 0, 0)).unwrap();
        let second = expr.next_after(first).unwrap();
        let third = expr.next_after(second).unwrap();
        assert_eq!([first.minute(), second.minute(), third.minute()], [5, 25, 45]);
    }

    #[test]
    fn test_resolve_rejects_both_forms() {
        let spec = CronSpec {
            minute: Some("0".into()),
            crontab: Some("0 * * * *".into()),
            ..CronSpec::default()
        };
        assert!(CronExpression::resolve(&spec).unwrap_err().is_configuration());
    }

    #[test]
    fn test_resolve_defaults_missing_fields_to_wildcard() {
        let spec = CronSpec {
            minute: Some("0".into()),
            hour: Some("3".into()),
            ..CronSpec::default()
        };
        let expr = CronExpression::resolve(&spec).unwrap();
        assert_eq!(expr.to_string(), "0 3 * * *");
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["60 * * * *", "* 24 * * *", "* * 0 * *", "* * * 13 *", "* * * * 8",
                    "*/0 * * * *", "5-1 * * * *", "* * * * funday", "* * * *"] {
            let err = bad.parse::<CronExpression>().unwrap_err();
            assert!(err.is_configuration(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_day_of_week_lookup() {
        assert_eq!(day_of_week_name("0"), Some("Sunday"));
        assert_eq!(day_of_week_name("7"), Some("Sunday"));
        assert_eq!(day_of_week_name("fri"), Some("Friday"));
        assert_eq!(day_of_week_name("TUESDAY"), Some("Tuesday"));
        assert_eq!(day_of_week_name("8"), None);
        assert_eq!(day_of_week_name("tues"), None);
    }

    #[test]
    fn test_expression_persists_as_plain_fields() {
        let expr: CronExpression = "*/5 9-17 * * mon-fri".parse().unwrap();
        let stored = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            stored,
            serde_json::json!({
                "minute": "*/5",
                "hour": "9-17",
                "day": "*",
                "month": "*",
                "day_of_week": "mon-fri",
            })
        );

        let loaded: CronExpression = serde_json::from_value(stored).unwrap();
        assert_eq!(loaded, expr);
        let start = at(2025, 3, 3, 8, 0);
        assert_eq!(loaded.next_after(start), expr.next_after(start));
    }

    #[test]
    fn test_loading_rejects_invalid_stored_fields() {
        let stored = serde_json::json!({
            "minute": "61",
            "hour": "*",
            "day": "*",
            "month": "*",
            "day_of_week": "*",
        });
        assert!(serde_json::from_value::<CronExpression>(stored).is_err());
    }

    /// One field as text plus the values it should allow
    type FieldCase = (String, BTreeSet<u32>);

    fn field_item(
        min: u32,
        max: u32,
        max_value: u32,
        names: &'static [&'static str],
        name_base: u32,
    ) -> BoxedStrategy<FieldCase> {
        let span = max - min;
        let mut options: Vec<BoxedStrategy<FieldCase>> = vec![
            Just(("*".to_string(), (min..=max).collect::<BTreeSet<u32>>())).boxed(),
            (min..=max_value)
                .prop_map(|v| (v.to_string(), BTreeSet::from([v])))
                .boxed(),
            (min..=max_value, min..=max_value)
                .prop_map(|(a, b)| {
                    let (a, b) = (a.min(b), a.max(b));
                    (format!("{a}-{b}"), (a..=b).collect::<BTreeSet<u32>>())
                })
                .boxed(),
            (1..=span)
                .prop_map(move |n| (format!("*/{n}"), (min..=max).step_by(n as usize).collect::<BTreeSet<u32>>()))
                .boxed(),
            (min..=max_value, 1..=span)
                .prop_map(move |(v, n)| (format!("{v}/{n}"), (v..=max).step_by(n as usize).collect::<BTreeSet<u32>>()))
                .boxed(),
            (min..=max_value, min..=max_value, 1..=span)
                .prop_map(|(a, b, n)| {
                    let (a, b) = (a.min(b), a.max(b));
                    (format!("{a}-{b}/{n}"), (a..=b).step_by(n as usize).collect::<BTreeSet<u32>>())
                })
                .boxed(),
        ];
        if !names.is_empty() {
            options.push(
                (0..names.len(), any::<bool>(), any::<bool>())
                    .prop_map(move |(idx, short, upper)| {
                        let name = if short { &names[idx][..3] } else { names[idx] };
                        let name = if upper { name.to_uppercase() } else { name.to_lowercase() };
                        (name, BTreeSet::from([idx as u32 + name_base]))
                    })
                    .boxed(),
            );
        }
        proptest::strategy::Union::new(options).boxed()
    }

    fn field(
        min: u32,
        max: u32,
        max_value: u32,
        names: &'static [&'static str],
        name_base: u32,
    ) -> impl Strategy<Value = FieldCase> {
        prop::collection::vec(field_item(min, max, max_value, names, name_base), 1..=2).prop_map(
            |items| {
                let text: Vec<String> = items.iter().map(|(text, _)| text.clone()).collect();
                let values: BTreeSet<u32> = items.into_iter().flat_map(|(_, values)| values).collect();
                (text.join(","), values)
            },
        )
    }

    fn day_of_week_field() -> impl Strategy<Value = FieldCase> {
        field(0, 7, 7, &DAY_NAMES, 0).prop_map(|(text, values)| {
            let values: BTreeSet<u32> = values.into_iter().map(|v| v % 7).collect();
            (text, values)
        })
    }

    proptest! {
        #[test]
        fn test_fire_times_increase_and_match_fields(
            (minute, minutes) in field(0, 59, 59, &[], 0),
            (hour, hours) in field(0, 23, 23, &[], 0),
            // Days past the 28th may never line up with a restricted weekday
            (day, days) in field(1, 31, 28, &[], 0),
            (month, months) in field(1, 12, 12, &MONTH_NAMES, 1),
            (dow, weekdays) in day_of_week_field(),
            start_offset in 0i64..(365 * 24 * 60),
        ) {
            let text = format!("{minute} {hour} {day} {month} {dow}");
            let expr: CronExpression = text.parse().unwrap();
            let mut cursor = at(2024, 1, 1, 0, 0) + chrono::Duration::minutes(start_offset);
            for _ in 0..3 {
                let next = expr.next_after(cursor);
                prop_assert!(next.is_some(), "{} never fires after {}", text, cursor);
                let next = next.unwrap();
                prop_assert!(next > cursor);
                prop_assert_eq!(next.second(), 0);
                prop_assert!(minutes.contains(&next.minute()), "{} fired at {}", text, next);
                prop_assert!(hours.contains(&next.hour()), "{} fired at {}", text, next);
                prop_assert!(days.contains(&next.day()), "{} fired at {}", text, next);
                prop_assert!(months.contains(&next.month()), "{} fired at {}", text, next);
                prop_assert!(
                    weekdays.contains(&next.weekday().num_days_from_sunday()),
                    "{} fired at {}", text, next
                );
                cursor = next;
            }
        }
    }
}
