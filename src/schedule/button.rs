use chrono::{TimeDelta, Utc};
use std::fmt;
use std::fs;
use std::io;
use std::time::Duration;

use super::ScheduleEntry;
use crate::{Result, Timestamp};

const UPTIME_PATH: &str = "/proc/uptime";

/// Instant the system booted, derived from the kernel uptime
pub fn boot_instant() -> Result<Timestamp> {
    let raw = fs::read_to_string(UPTIME_PATH)?;
    let seconds: f64 = raw
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unexpected {UPTIME_PATH} contents: {raw:?}"),
            )
        })?;
    Ok(Utc::now() - TimeDelta::milliseconds((seconds * 1000.0) as i64))
}

/// Keeps the board up for a while after a manual power-on
///
/// The session starts at boot and ends `hold` later. It never starts again.
/// Without a hold the session never ends, so a manual power-on is never
/// followed by an automatic shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonSession {
    boot_instant: Timestamp,
    hold: Option<TimeDelta>,
}

impl ButtonSession {
    /// A zero or missing `hold` yields a session that stays active
    pub fn new(boot_instant: Timestamp, hold: Option<Duration>) -> Self {
        let hold = hold
            .filter(|h| !h.is_zero())
            .and_then(|h| TimeDelta::from_std(h).ok());
        Self { boot_instant, hold }
    }

    fn ends_at(&self) -> Option<Timestamp> {
        self.hold.map(|hold| self.boot_instant + hold)
    }
}

impl ScheduleEntry for ButtonSession {
    fn active(&self, t: Timestamp) -> bool {
        self.ends_at().map_or(true, |end| t < end)
    }

    fn next_start(&self, _t: Timestamp) -> Option<Timestamp> {
        None
    }

    fn prev_start(&self, _t: Timestamp) -> Option<Timestamp> {
        Some(self.boot_instant)
    }

    fn next_stop(&self, _t: Timestamp) -> Option<Timestamp> {
        None
    }

    fn prev_stop(&self, t: Timestamp) -> Option<Timestamp> {
        self.ends_at().filter(|end| *end > t)
    }
}

impl fmt::Display for ButtonSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ends_at() {
            Some(end) => write!(f, "button session ({} - {})", self.boot_instant, end),
            None => write!(f, "button session ({}, no hold)", self.boot_instant),
        }
    }
}
