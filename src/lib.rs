/*!
 # Schedule-driven power controller

 A Rust library for unattended power cycling of single-board computers that
 carry a real-time-clock alarm peripheral, either a microcontroller HAT
 reached over I2C or the board's onboard RTC exposed through sysfs.

 ## Features

 * BCD register codec and sparse alarm registers with wildcard fields
 * Concrete next-fire reconstruction from wildcard alarms
 * Uniform `PowerManager` interface over both hardware backends
 * Interval scheduling over absolute and sunrise/sunset relative windows
 * Manual power-on sessions that keep the board awake for a while
 * A daemon state machine that validates the clock before trusting it

 ## Example

 ```no_run
 use powersched::*;
 use powersched::power::RegisterPowerManager;

 fn main() -> Result<()> {
     let bus = linux_embedded_hal::I2cdev::new("/dev/i2c-1")
         .map_err(|e| Error::Connectivity(e.to_string()))?;
     let mut device = RegisterPowerManager::new(bus, power::DEFAULT_ADDRESS)?;

     let config = ScheduleConfig::from_yaml_str(
         "schedule:\n  - {name: morning, start: '08:00', stop: '12:00'}\n",
     );
     let schedule = ScheduleSet::from_config(&config);

     let now = device.device_time()?;
     device.set_startup(schedule.next_startup(now))?;
     device.set_shutdown(schedule.next_shutdown(now))?;
     Ok(())
 }
 ```
*/

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Instants exchanged with hardware and the scheduler
pub type Timestamp = DateTime<Utc>;

/// Custom error types for the power controller library
#[derive(Error, Debug)]
pub enum Error {
    /// Bus or sysfs interface unreachable, or wrong device identity
    #[error("Cannot connect to power management hardware: {0}")]
    Connectivity(String),

    /// Neither supported backend was found
    #[error("No supported power management hardware detected")]
    NoHardware,

    /// Device clock registers do not hold a valid date
    #[error("RTC is unset")]
    ClockUnset,

    /// Device clock is earlier than the last known good time
    #[error("RTC is implausible ({device}), last known time is {floor}")]
    ClockImplausible { device: Timestamp, floor: Timestamp },

    /// Device clock disagrees with the host clock
    #[error("RTC ({device}) does not match system clock ({system})")]
    ClockMismatch { device: Timestamp, system: Timestamp },

    /// No source for a last known good time exists at all
    #[error("No clock sources available, all clock files are missing")]
    NoClockSource,

    /// A single register read or write failed
    #[error("Register {register:#04x} access failed: {reason}")]
    Register { register: u8, reason: String },

    /// Operation not offered by this backend
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Schedule configuration problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error (sysfs, clock files, marker files)
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for a fatal error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoHardware => 2,
            Error::ClockUnset
            | Error::ClockImplausible { .. }
            | Error::ClockMismatch { .. }
            | Error::NoClockSource => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod alarm;
pub mod bcd;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod detect;
pub mod power;
pub mod schedule;

// Re-export key types
pub use alarm::{resolve_next_fire, AlarmField, AlarmSet};
pub use config::ScheduleConfig;
pub use daemon::{Daemon, DaemonOptions, DaemonState};
pub use detect::{detect_hardware, HardwareKind};
pub use power::{ActionReason, Halt, PowerManager};
pub use schedule::{ButtonSession, ScheduleEntry, ScheduleSet};
