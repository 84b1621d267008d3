//! Calendar ranges for temporal shortcut lookups.
//!
//! Ranges are half-open (`start <= x < end`) and resolved against the
//! compiler's "today" when the filter is compiled.

use chrono::{Datelike, Duration, NaiveDate};
use serde_json::Value;

use super::lookup::Temporal;

/// A resolved `[start, end)` date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// `false` was passed as the lookup value: match outside the range.
    pub negated: bool,
}

fn shift(date: NaiveDate, days: i64) -> Result<NaiveDate, String> {
    date.checked_add_signed(Duration::days(days))
        .ok_or_else(|| "date out of range".to_string())
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate, String> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| "date out of range".to_string())
}

fn next_month(date: NaiveDate) -> Result<NaiveDate, String> {
    if date.month() == 12 {
        first_of_month(date.year() + 1, 1)
    } else {
        first_of_month(date.year(), date.month() + 1)
    }
}

/// Resolve a shortcut. `past_days` takes a day count; the others take a
/// boolean (`true` to match, `false` to exclude).
pub fn resolve(shortcut: Temporal, value: &Value, today: NaiveDate) -> Result<DateRange, String> {
    let negated = matches!(value, Value::Bool(false));
    let tomorrow = shift(today, 1)?;

    let (start, end) = match shortcut {
        Temporal::Today => (today, tomorrow),
        Temporal::Yesterday => (shift(today, -1)?, today),
        Temporal::ThisWeek => {
            let monday = shift(today, -i64::from(today.weekday().num_days_from_monday()))?;
            (monday, shift(monday, 7)?)
        }
        Temporal::ThisMonth => {
            let start = first_of_month(today.year(), today.month())?;
            (start, next_month(start)?)
        }
        Temporal::ThisYear => (
            first_of_month(today.year(), 1)?,
            first_of_month(today.year() + 1, 1)?,
        ),
        Temporal::PastWeek => (shift(today, -6)?, tomorrow),
        Temporal::PastMonth => (shift(today, -29)?, tomorrow),
        Temporal::PastYear => (shift(today, -364)?, tomorrow),
        Temporal::PastDays => {
            let days = value
                .as_i64()
                .filter(|d| (1..=36_600).contains(d))
                .ok_or_else(|| "past_days expects a positive day count".to_string())?;
            (shift(today, 1 - days)?, tomorrow)
        }
    };

    if shortcut != Temporal::PastDays && !value.is_boolean() {
        return Err(format!("{} expects true or false", shortcut.as_str()));
    }

    Ok(DateRange {
        start,
        end,
        negated: negated && shortcut != Temporal::PastDays,
    })
}
