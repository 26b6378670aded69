//! Natural-language descriptions of cron expressions
//!
//! `"30 9 15 * *"` becomes `"day 15 of every month at 09:30"` and
//! `"*/15 * * * 1-5"` becomes `"every 15 minutes, Monday through Friday"`.

use super::cron::{Base, CronExpression, CronField, FieldItem, month_name, weekday_name};
use crate::errors::QueueResult;

fn join_words(parts: Vec<String>) -> String {
    match parts.len() {
        0 => String::new(),
        1 => parts.into_iter().next().unwrap_or_default(),
        n => {
            let head = parts[..n - 1].join(", ");
            format!("{head} and {}", parts[n - 1])
        }
    }
}

fn item_phrase(item: &FieldItem, unit: &str, name: &dyn Fn(u32) -> String) -> String {
    match (item.base, item.step) {
        (Base::Any, None) => format!("every {unit}"),
        (Base::Any, Some(n)) => format!("every {n} {unit}s"),
        (Base::Value(v), None) => name(v),
        (Base::Value(v), Some(n)) => format!("every {n} {unit}s from {}", name(v)),
        (Base::Range(a, b), None) => format!("{} through {}", name(a), name(b)),
        (Base::Range(a, b), Some(n)) => {
            format!("every {n} {unit}s from {} through {}", name(a), name(b))
        }
    }
}

fn list_phrase(items: &[FieldItem], unit: &str, name: &dyn Fn(u32) -> String) -> String {
    join_words(items.iter().map(|item| item_phrase(item, unit, name)).collect())
}

fn single_value(items: &[FieldItem]) -> Option<u32> {
    match items {
        [FieldItem { base: Base::Value(v), step: None }] => Some(*v),
        _ => None,
    }
}

fn is_wildcard(items: &[FieldItem]) -> bool {
    matches!(items, [FieldItem { base: Base::Any, step: None }])
}

fn is_plain_step(items: &[FieldItem]) -> Option<u32> {
    match items {
        [FieldItem { base: Base::Any, step: Some(n) }] => Some(*n),
        _ => None,
    }
}

/// Plural-aware "day 15" / "days 1 and 15" style prefix
fn numbered(singular: &str, items: &[FieldItem], name: &dyn Fn(u32) -> String) -> String {
    if let Some(n) = is_plain_step(items) {
        return format!("every {n} {singular}s");
    }
    let plural = items.len() > 1 || items.iter().any(|i| !matches!(i.base, Base::Value(_)));
    let label = if plural { format!("{singular}s") } else { singular.to_string() };
    format!("{label} {}", list_phrase(items, singular, name))
}

fn time_phrase(minutes: &[FieldItem], hours: &[FieldItem]) -> (String, bool) {
    let number = |v: u32| v.to_string();
    let hours_phrase = || match is_plain_step(hours) {
        Some(n) => format!("every {n} hours"),
        None => numbered("hour", hours, &number),
    };

    match (single_value(minutes), single_value(hours)) {
        (Some(m), Some(h)) => (format!("at {h:02}:{m:02}"), false),
        (Some(m), None) if is_wildcard(hours) => (format!("at minute {m} of every hour"), true),
        (Some(m), None) => (format!("at minute {m} past {}", hours_phrase()), true),
        (None, hour) => {
            let minute_phrase = if is_wildcard(minutes) {
                "every minute".to_string()
            } else if let Some(n) = is_plain_step(minutes) {
                format!("every {n} minutes")
            } else {
                format!("at {}", numbered("minute", minutes, &number))
            };
            let suffix = if is_wildcard(hours) {
                String::new()
            } else if let Some(h) = hour {
                format!(" during hour {h}")
            } else {
                format!(" past {}", hours_phrase())
            };
            (format!("{minute_phrase}{suffix}"), true)
        }
    }
}

fn day_phrase(days: &[FieldItem], months: &[FieldItem], weekdays: &[FieldItem]) -> String {
    let number = |v: u32| v.to_string();
    let month = |v: u32| month_name(v).to_string();
    let weekday = |v: u32| weekday_name(v).to_string();

    let months_phrase = if is_wildcard(months) {
        None
    } else {
        Some(list_phrase(months, "month", &month))
    };
    let weekdays_phrase = || {
        let ranged = weekdays.iter().any(|i| !matches!(i.base, Base::Value(_)));
        let listed = list_phrase(weekdays, "day", &weekday);
        if ranged { listed } else { format!("every {listed}") }
    };

    match (is_wildcard(days), is_wildcard(weekdays)) {
        (true, true) => match months_phrase {
            Some(m) => format!("every day in {m}"),
            None => "every day".to_string(),
        },
        (false, true) => {
            let of = months_phrase.unwrap_or_else(|| "every month".to_string());
            format!("{} of {of}", numbered("day", days, &number))
        }
        (true, false) => match months_phrase {
            Some(m) => format!("{} in {m}", weekdays_phrase()),
            None => weekdays_phrase(),
        },
        (false, false) => {
            let of = months_phrase.unwrap_or_else(|| "every month".to_string());
            format!(
                "{} of {of} when it falls on {}",
                numbered("day", days, &number),
                list_phrase(weekdays, "day", &weekday)
            )
        }
    }
}

/// Describe a validated cron expression in plain English
pub fn describe_cron(expr: &CronExpression) -> QueueResult<String> {
    let minutes = expr.items(CronField::Minute)?;
    let hours = expr.items(CronField::Hour)?;
    let days = expr.items(CronField::Day)?;
    let months = expr.items(CronField::Month)?;
    let weekdays = expr.items(CronField::DayOfWeek)?;

    let (time, repeats_within_day) = time_phrase(&minutes, &hours);
    let day = day_phrase(&days, &months, &weekdays);

    Ok(match (day.as_str(), repeats_within_day) {
        ("every day", true) => time,
        (_, true) => format!("{time}, {day}"),
        (_, false) => format!("{day} {time}"),
    })
}
