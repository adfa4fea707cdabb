/*!
 # Schedule daemon

 Keeps the alarm hardware in line with the schedule while the board is up.

 The daemon moves through four states. It starts by validating the device
 clock and refuses to run on a clock it cannot trust. While running it
 periodically reprograms both alarms, halting the system once the shutdown
 time is due. On termination it disarms the shutdown alarm and leaves the
 startup alarm pointing at the next scheduled window.
*/

use chrono::{TimeDelta, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::clock::{self, TimeSources, DEFAULT_SYNC_MARKER};
use crate::config::ScheduleConfig;
use crate::power::{Halt, PowerManager, SystemHalt, DEFAULT_CLOCK_TOLERANCE};
use crate::schedule::{self, ButtonSession, ScheduleSet};
use crate::{Error, Result, Timestamp};

/// Lifecycle of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    ValidatingClock,
    Running,
    Terminating,
    Stopped,
}

/// What one pass of the main loop decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep polling
    Continue,
    /// The system is going down
    Halted,
}

/// Tunables of the main loop
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Time between two passes of the main loop
    pub poll_interval: Duration,
    /// Shutdown delay armed when the schedule says the board should be off
    pub drift_shutdown_delay: Duration,
    /// Allowed difference between device and system clock
    pub clock_tolerance: Duration,
    /// Sources of the last known good time
    pub time_sources: TimeSources,
    /// Touched once the clock is validated, `None` skips it
    pub sync_marker: Option<PathBuf>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            drift_shutdown_delay: Duration::from_secs(30),
            clock_tolerance: DEFAULT_CLOCK_TOLERANCE,
            time_sources: TimeSources::default(),
            sync_marker: Some(PathBuf::from(DEFAULT_SYNC_MARKER)),
        }
    }
}

/// The schedule daemon, owning one power manager
pub struct Daemon<P, H = SystemHalt> {
    power: P,
    halt: H,
    options: DaemonOptions,
    state: DaemonState,
    span: Span,
}

impl<P: PowerManager, H: Halt> Daemon<P, H> {
    /// All logging of the daemon happens inside `span`
    pub fn new(power: P, halt: H, options: DaemonOptions, span: Span) -> Self {
        Self {
            power,
            halt,
            options,
            state: DaemonState::ValidatingClock,
            span,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    fn transition(&mut self, next: DaemonState) {
        debug!("State {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs until `stop` turns true or the system halts
    ///
    /// Register and sysfs access, and halting, block the calling thread.
    /// The daemon is the only task on its runtime thread, so the blocking
    /// calls only delay its own next poll.
    pub async fn run(
        &mut self,
        config: &ScheduleConfig,
        stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let span = self.span.clone();
        self.serve(config, stop).instrument(span).await
    }

    async fn serve(
        &mut self,
        config: &ScheduleConfig,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        self.transition(DaemonState::ValidatingClock);
        let reason = self.power.power_on_reason()?;
        info!("Starting, power-on reason: {}", reason);
        self.validate_clock()?;

        self.transition(DaemonState::Running);
        let boot = schedule::boot_instant().unwrap_or_else(|e| {
            warn!("Boot time unknown ({}), assuming now", e);
            Utc::now()
        });
        let schedule = self.load_schedule(config, boot)?;

        while !*stop.borrow() {
            if self.tick(&schedule)? == Tick::Halted {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        warn!("Stop channel closed, terminating");
                        break;
                    }
                }
            }
        }

        self.transition(DaemonState::Terminating);
        self.finish(&schedule)?;
        self.transition(DaemonState::Stopped);
        Ok(())
    }

    /// Refuses device clocks that are unset, behind the last known time, or
    /// out of step with the system clock
    pub fn validate_clock(&mut self) -> Result<()> {
        let device = self.power.device_time()?;
        let floor = self.options.time_sources.last_known_time().map_err(|e| {
            error!("{}", e);
            e
        })?;
        clock::ensure_plausible(device, floor)?;

        if !self.power.clock_matches_system(self.options.clock_tolerance)? {
            let system = Utc::now();
            warn!("RTC ({}) and system clock ({}) disagree", device, system);
            return Err(Error::ClockMismatch { device, system });
        }
        info!("RTC {} is plausible and matches the system clock", device);

        if let Some(marker) = &self.options.sync_marker {
            match clock::mark_synchronized(marker) {
                Ok(()) => debug!("Touched {}", marker.display()),
                Err(e) => warn!("Cannot touch {}: {}", marker.display(), e),
            }
        }
        Ok(())
    }

    /// Acknowledges alarms, applies daemon settings and builds the schedule
    ///
    /// A manual power-on adds a [`ButtonSession`] anchored at `boot`.
    pub fn load_schedule(&mut self, config: &ScheduleConfig, boot: Timestamp) -> Result<ScheduleSet> {
        self.power.prepare_for_daemon()?;
        self.power.clear_alarm_flags()?;

        let mut schedule = ScheduleSet::from_config(config);
        let reason = self.power.power_on_reason()?;
        if reason.is_manual_wake() {
            let session = ButtonSession::new(boot, schedule.button_delay());
            info!("Powered on by {}, adding {}", reason, session);
            schedule.push_entry(Box::new(session));
        }
        Ok(schedule)
    }

    /// One pass of the main loop
    pub fn tick(&mut self, schedule: &ScheduleSet) -> Result<Tick> {
        let now = self.power.device_time()?;
        let next_startup = schedule.next_startup(now);
        let next_shutdown = schedule.next_shutdown(now);
        info!(
            "Setting next shutdown: {:?}, next startup: {:?}",
            next_shutdown, next_startup
        );
        self.power.set_startup(next_startup)?;
        self.power.set_shutdown(next_shutdown)?;

        if let Some(at) = self.power.get_shutdown()? {
            if at <= now {
                warn!("Shutdown time {} has arrived, shutting down", at);
                self.halt.halt()?;
                return Ok(Tick::Halted);
            }
        }

        if !schedule.active(now) {
            let delay = self.options.drift_shutdown_delay;
            info!("Schedule is inactive, shutting down in {:?}", delay);
            let at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::seconds(30));
            self.power.set_shutdown(Some(at))?;
            return Ok(Tick::Continue);
        }

        let reason = self.power.power_on_reason()?;
        if reason.demands_shutdown() {
            warn!("Hardware reports {}, shutting down", reason);
            self.halt.halt()?;
            return Ok(Tick::Halted);
        }
        Ok(Tick::Continue)
    }

    /// Leaves only the startup alarm armed
    pub fn finish(&mut self, schedule: &ScheduleSet) -> Result<()> {
        self.power.set_shutdown(None)?;
        let now = self.power.device_time()?;
        self.power.set_startup(schedule.next_startup(now))?;
        info!(
            "Terminating, shutdown: {:?}, startup: {:?}",
            self.power.get_shutdown()?,
            self.power.get_startup()?
        );
        Ok(())
    }
}
