/*!
 # Power schedules

 A schedule is a set of entries, each answering when it is active and when
 it starts and stops around a given instant. The board should be up while
 any entry is active; [`ScheduleSet`] turns that into the next startup and
 shutdown instants to program into the alarm hardware.
*/

use chrono::{Local, TimeDelta, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{ScheduleConfig, DEFAULT_GEOLOCATION_PATH};
use crate::Timestamp;

mod button;
mod window;

pub use button::{boot_instant, ButtonSession};
pub use window::{DailyWindow, SolarEvents, SunCalculator, TimeExpr};

/// Something that wants the board powered during some intervals
pub trait ScheduleEntry: fmt::Debug + fmt::Display + Send {
    /// Whether `t` lies inside one of the entry's intervals
    fn active(&self, t: Timestamp) -> bool;

    /// First interval start after `t`
    fn next_start(&self, t: Timestamp) -> Option<Timestamp>;

    /// Latest interval start at or before `t`
    fn prev_start(&self, t: Timestamp) -> Option<Timestamp>;

    /// Stop of the interval returned by [`ScheduleEntry::next_start`]
    fn next_stop(&self, t: Timestamp) -> Option<Timestamp>;

    /// Stop of the interval returned by [`ScheduleEntry::prev_start`]
    fn prev_stop(&self, t: Timestamp) -> Option<Timestamp>;
}

/// All entries that keep the board powered
#[derive(Debug)]
pub struct ScheduleSet {
    entries: Vec<Box<dyn ScheduleEntry>>,
    force_on: bool,
    button_delay: Option<Duration>,
}

impl ScheduleSet {
    /// Without any entry the set fails open and keeps the board on
    pub fn new(
        entries: Vec<Box<dyn ScheduleEntry>>,
        force_on: bool,
        button_delay: Option<Duration>,
    ) -> Self {
        let force_on = if entries.is_empty() && !force_on {
            warn!("No valid schedule entries, setting force_on");
            true
        } else {
            force_on
        };
        Self {
            entries,
            force_on,
            button_delay,
        }
    }

    /// Builds the set, taking a missing location from the geolocation file
    pub fn from_config(config: &ScheduleConfig) -> Self {
        let location = config.location(Path::new(DEFAULT_GEOLOCATION_PATH));
        Self::from_config_with_location(config, location)
    }

    /// Builds the set for a known (or absent) location
    ///
    /// Entries that fail to parse are skipped, as are sunrise/sunset
    /// entries when no location is known.
    pub fn from_config_with_location(
        config: &ScheduleConfig,
        location: Option<(f64, f64)>,
    ) -> Self {
        let solar = location.map(|(lat, lon)| {
            Arc::new(SunCalculator::new(lat, lon)) as Arc<dyn SolarEvents>
        });
        if solar.is_none() {
            warn!("No location configured, sunrise/sunset entries will be skipped");
        }
        let zone = config.zone();

        let mut force_on = config.force_on;
        if force_on {
            info!("force_on is set, the system stays on");
        }

        let mut entries: Vec<Box<dyn ScheduleEntry>> = Vec::new();
        match &config.schedule {
            None => {
                warn!("Schedule missing in configuration, setting force_on");
                force_on = true;
            }
            Some(list) => {
                for entry in list {
                    let built: crate::Result<Box<dyn ScheduleEntry>> = match zone {
                        Some(tz) => DailyWindow::new(
                            &entry.name,
                            &entry.start,
                            &entry.stop,
                            tz,
                            solar.clone(),
                        )
                        .map(|w| Box::new(w) as Box<dyn ScheduleEntry>),
                        None => DailyWindow::new(
                            &entry.name,
                            &entry.start,
                            &entry.stop,
                            Local,
                            solar.clone(),
                        )
                        .map(|w| Box::new(w) as Box<dyn ScheduleEntry>),
                    };
                    match built {
                        Ok(window) => entries.push(window),
                        Err(e) => warn!("Skipping schedule entry '{}': {}", entry.name, e),
                    }
                }
            }
        }

        let set = Self::new(entries, force_on, config.button_delay());
        set.log_summary(Utc::now());
        set
    }

    pub fn push_entry(&mut self, entry: Box<dyn ScheduleEntry>) {
        debug!("Adding entry {}", entry);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Box<dyn ScheduleEntry>] {
        &self.entries
    }

    pub fn force_on(&self) -> bool {
        self.force_on
    }

    pub fn button_delay(&self) -> Option<Duration> {
        self.button_delay
    }

    /// The board should be up at `now`
    pub fn active(&self, now: Timestamp) -> bool {
        self.force_on || self.entries.iter().any(|e| e.active(now))
    }

    /// Earliest entry start strictly after `now`
    pub fn next_startup(&self, now: Timestamp) -> Option<Timestamp> {
        self.entries
            .iter()
            .filter_map(|e| e.next_start(now))
            .filter(|start| *start > now)
            .min()
    }

    /// Instant from which no entry is active any more
    ///
    /// Follows overlapping and back-to-back intervals forward from `now`.
    /// Returns `now` when nothing is active, and `None` when the board stays
    /// up for a day or more.
    pub fn next_shutdown(&self, now: Timestamp) -> Option<Timestamp> {
        if self.force_on {
            return None;
        }

        let horizon = now + TimeDelta::days(1);
        let mut next_ts = now;
        while self.active(next_ts) {
            let candidate = self
                .entries
                .iter()
                .filter_map(|e| {
                    let active = e.active(next_ts);
                    let stop = if active {
                        e.prev_stop(next_ts)
                    } else {
                        e.next_stop(next_ts)
                    };
                    trace!("{} (active: {}) stops at {:?}", e, active, stop);
                    stop
                })
                .filter(|stop| *stop > now)
                .min();

            let Some(candidate) = candidate else {
                info!("No stop events found, staying online for over a day");
                return None;
            };
            if candidate <= next_ts {
                warn!("Schedule makes no progress at {}, staying online", next_ts);
                return None;
            }
            next_ts = candidate;
            if next_ts >= horizon {
                debug!("Online for more than a day after {}", now);
                return None;
            }
        }
        Some(next_ts)
    }

    fn log_summary(&self, now: Timestamp) {
        info!(
            "Schedule loaded, active: {}, next shutdown: {:?}, next startup: {:?}",
            self.active(now),
            self.next_shutdown(now),
            self.next_startup(now)
        );
        for entry in &self.entries {
            info!(
                "{} active: {}, next start: {:?}, next stop: {:?}",
                entry,
                entry.active(now),
                entry.next_start(now),
                entry.next_stop(now)
            );
        }
    }
}
