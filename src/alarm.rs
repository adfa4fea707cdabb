/*!
 # Sparse alarm registers

 The power controller stores each alarm as five independent fields (day of
 month, weekday, hour, minute, second). Any field can be a wildcard, in which
 case the hardware ignores it while matching the current time. This module
 models such alarms and reconstructs the concrete instant at which one fires.
*/

use chrono::{Datelike, Duration, Timelike};
use std::fmt;
use tracing::{trace, warn};

use crate::Timestamp;

/// Decoded register value meaning "ignore this field"
pub const WILDCARD: u8 = 80;

/// Longest day-of-month search: from the first of a short month to the 31st of the next
const DAY_SEARCH_LIMIT: u32 = 62;

/// One alarm field, either a concrete value or a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmField {
    /// Matches any value
    Wildcard,
    /// Matches exactly this value
    Value(u8),
}

impl AlarmField {
    /// Interpret a decoded (binary) register value
    pub fn from_register(value: u8) -> Self {
        if value == WILDCARD {
            AlarmField::Wildcard
        } else {
            AlarmField::Value(value)
        }
    }

    /// Decoded (binary) value to store in the register
    pub fn to_register(self) -> u8 {
        match self {
            AlarmField::Wildcard => WILDCARD,
            AlarmField::Value(v) => v,
        }
    }

    /// Whether `actual` satisfies this field
    pub fn matches(self, actual: u32) -> bool {
        match self {
            AlarmField::Wildcard => true,
            AlarmField::Value(v) => u32::from(v) == actual,
        }
    }

    pub fn is_wildcard(self) -> bool {
        self == AlarmField::Wildcard
    }
}

impl fmt::Display for AlarmField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmField::Wildcard => write!(f, "**"),
            AlarmField::Value(v) => write!(f, "{v:02}"),
        }
    }
}

/// A complete startup or shutdown alarm
///
/// Weekdays count from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmSet {
    pub day: AlarmField,
    pub weekday: AlarmField,
    pub hour: AlarmField,
    pub minute: AlarmField,
    pub second: AlarmField,
}

impl AlarmSet {
    /// All fields wildcarded, the hardware never fires
    pub fn disabled() -> Self {
        Self {
            day: AlarmField::Wildcard,
            weekday: AlarmField::Wildcard,
            hour: AlarmField::Wildcard,
            minute: AlarmField::Wildcard,
            second: AlarmField::Wildcard,
        }
    }

    /// Alarm firing at `ts` (within the next month)
    ///
    /// The weekday stays wildcarded since day of month already pins the date.
    pub fn at(ts: Timestamp) -> Self {
        Self {
            day: AlarmField::Value(ts.day() as u8),
            weekday: AlarmField::Wildcard,
            hour: AlarmField::Value(ts.hour() as u8),
            minute: AlarmField::Value(ts.minute() as u8),
            second: AlarmField::Value(ts.second() as u8),
        }
    }

    /// True for both disabled encodings: all wildcards, or day 0
    pub fn is_disabled(&self) -> bool {
        let all_wildcard = self.day.is_wildcard()
            && self.weekday.is_wildcard()
            && self.hour.is_wildcard()
            && self.minute.is_wildcard()
            && self.second.is_wildcard();
        all_wildcard || self.day == AlarmField::Value(0)
    }
}

impl fmt::Display for AlarmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "day {} (weekday {}) {}:{}:{}",
            self.day, self.weekday, self.hour, self.minute, self.second
        )
    }
}

/// Advance `ts` by `step` until `field` matches `part(ts)`, at most `limit` times
fn roll_until(
    ts: Timestamp,
    field: AlarmField,
    step: Duration,
    limit: u32,
    part: impl Fn(&Timestamp) -> u32,
) -> Option<Timestamp> {
    let mut ts = ts;
    for _ in 0..=limit {
        if field.matches(part(&ts)) {
            return Some(ts);
        }
        ts += step;
    }
    None
}

/// Find the first instant at or after `now` at which `set` fires
///
/// Fields are resolved from the finest to the coarsest (second, minute,
/// hour, weekday, day) so the search stops at the nearest match. An alarm
/// that already matches `now` resolves to `now`. Disabled alarms, and
/// alarms whose fields can never match, resolve to `None`.
pub fn resolve_next_fire(set: &AlarmSet, now: Timestamp) -> Option<Timestamp> {
    if set.is_disabled() {
        return None;
    }

    trace!("Iterating {} to match {}", now, set);

    let resolved = roll_until(now, set.second, Duration::seconds(1), 60, |t| t.second())
        .and_then(|t| roll_until(t, set.minute, Duration::minutes(1), 60, |t| t.minute()))
        .and_then(|t| roll_until(t, set.hour, Duration::hours(1), 24, |t| t.hour()))
        .and_then(|t| {
            roll_until(t, set.weekday, Duration::days(1), 7, |t| {
                t.weekday().num_days_from_monday()
            })
        })
        .and_then(|t| roll_until(t, set.day, Duration::days(1), DAY_SEARCH_LIMIT, |t| t.day()));

    if resolved.is_none() {
        warn!("Alarm {} can never fire, treating as disabled", set);
    }
    resolved
}
