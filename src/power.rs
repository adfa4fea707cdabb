/*!
 # Power management hardware

 A uniform interface over RTC alarm hardware. Two backends exist:

 * [`RegisterPowerManager`] talks to a microcontroller HAT over I2C and keeps
   both startup and shutdown alarms in battery-backed registers.
 * [`SysfsPowerManager`] uses the kernel's RTC wake alarm. Only the startup
   alarm is real hardware; the shutdown time lives in memory and the daemon
   acts on it.
*/

use chrono::Utc;
use std::fmt;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

use crate::{Result, Timestamp};

mod register;
mod sysfs;

pub use register::{Register, RegisterPowerManager, DEFAULT_ADDRESS, FIRMWARE_ID};
pub use sysfs::{SysfsPowerManager, DEFAULT_RTC_PATH};

/// Default allowed drift between device clock and host clock
pub const DEFAULT_CLOCK_TOLERANCE: Duration = Duration::from_secs(2);

/// Why the board was last powered on (or off)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionReason {
    /// Reason not reported by hardware
    NotAvailable,
    /// Scheduled startup alarm
    AlarmStartup,
    /// Scheduled shutdown alarm
    AlarmShutdown,
    /// Power button pressed
    ButtonClick,
    /// Input voltage dropped below threshold
    LowVoltage,
    /// Input voltage recovered above threshold
    VoltageRestore,
    /// Temperature rose above threshold
    OverTemperature,
    /// Temperature fell below threshold
    BelowTemperature,
    /// Startup alarm fired after its configured delay
    DelayedAlarmStartup,
    /// Power supply connected
    PowerConnected,
    /// System rebooted
    Reboot,
    /// Guaranteed wake fallback fired
    GuaranteedWake,
}

impl ActionReason {
    /// Decode the raw hardware code, unknown codes degrade to `NotAvailable`
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ActionReason::NotAvailable,
            0x01 => ActionReason::AlarmStartup,
            0x02 => ActionReason::AlarmShutdown,
            0x03 => ActionReason::ButtonClick,
            0x04 => ActionReason::LowVoltage,
            0x05 => ActionReason::VoltageRestore,
            0x06 => ActionReason::OverTemperature,
            0x07 => ActionReason::BelowTemperature,
            0x08 => ActionReason::DelayedAlarmStartup,
            0x0a => ActionReason::PowerConnected,
            0x0b => ActionReason::Reboot,
            0x0c => ActionReason::GuaranteedWake,
            other => {
                warn!("ActionReason {:#04x} is unknown!", other);
                ActionReason::NotAvailable
            }
        }
    }

    /// Power-on that did not come from the schedule
    pub fn is_manual_wake(self) -> bool {
        matches!(
            self,
            ActionReason::NotAvailable
                | ActionReason::ButtonClick
                | ActionReason::VoltageRestore
                | ActionReason::PowerConnected
        )
    }

    /// Hardware asked for the system to go down
    pub fn demands_shutdown(self) -> bool {
        matches!(
            self,
            ActionReason::AlarmShutdown | ActionReason::LowVoltage | ActionReason::OverTemperature
        )
    }
}

impl fmt::Display for ActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionReason::NotAvailable => "not-available",
            ActionReason::AlarmStartup => "alarm-startup",
            ActionReason::AlarmShutdown => "alarm-shutdown",
            ActionReason::ButtonClick => "button-click",
            ActionReason::LowVoltage => "low-voltage",
            ActionReason::VoltageRestore => "voltage-restore",
            ActionReason::OverTemperature => "over-temperature",
            ActionReason::BelowTemperature => "below-temperature",
            ActionReason::DelayedAlarmStartup => "delayed-alarm-startup",
            ActionReason::PowerConnected => "power-connected",
            ActionReason::Reboot => "reboot",
            ActionReason::GuaranteedWake => "guaranteed-wake",
        };
        f.write_str(name)
    }
}

/// RTC alarm hardware able to power the board on and off
///
/// Implementations own their bus or sysfs handle exclusively; every call is
/// synchronous and failures surface to the caller without retries.
pub trait PowerManager {
    /// Current device clock
    fn device_time(&mut self) -> Result<Timestamp>;

    /// Overwrite the device clock
    fn set_device_time(&mut self, ts: Timestamp) -> Result<()>;

    /// Arm (or with `None`, disarm) the power-on alarm
    fn set_startup(&mut self, ts: Option<Timestamp>) -> Result<()>;

    /// Instant at which the power-on alarm fires next
    fn get_startup(&mut self) -> Result<Option<Timestamp>>;

    /// Arm (or with `None`, disarm) the power-off alarm
    fn set_shutdown(&mut self, ts: Option<Timestamp>) -> Result<()>;

    /// Instant at which the power-off alarm fires next
    fn get_shutdown(&mut self) -> Result<Option<Timestamp>>;

    /// Acknowledge fired alarms
    fn clear_alarm_flags(&mut self) -> Result<()>;

    /// Cause of the latest power transition
    fn power_on_reason(&mut self) -> Result<ActionReason>;

    /// Whether the device clock is within `tolerance` of the host clock
    fn clock_matches_system(&mut self, tolerance: Duration) -> Result<bool> {
        let device = self.device_time()?;
        let drift = (device - Utc::now()).abs();
        Ok(drift.to_std().map_or(false, |d| d < tolerance))
    }

    /// One-time hardware settings applied when the daemon takes over
    fn prepare_for_daemon(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Brings the system down
pub trait Halt {
    fn halt(&mut self) -> Result<()>;
}

/// Halts through the system `shutdown` command
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHalt;

impl Halt for SystemHalt {
    fn halt(&mut self) -> Result<()> {
        info!("Invoking system shutdown");
        let status = Command::new("shutdown").arg("0").status()?;
        if !status.success() {
            warn!("shutdown exited with {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_reason_codes() {
        assert_eq!(ActionReason::from_code(0x01), ActionReason::AlarmStartup);
        assert_eq!(ActionReason::from_code(0x0a), ActionReason::PowerConnected);
        assert_eq!(ActionReason::from_code(0x0c), ActionReason::GuaranteedWake);
    }

    #[test]
    fn unknown_action_reason_degrades() {
        assert_eq!(ActionReason::from_code(0x09), ActionReason::NotAvailable);
        assert_eq!(ActionReason::from_code(0xff), ActionReason::NotAvailable);
    }

    #[test]
    fn manual_wake_reasons() {
        assert!(ActionReason::ButtonClick.is_manual_wake());
        assert!(ActionReason::NotAvailable.is_manual_wake());
        assert!(ActionReason::VoltageRestore.is_manual_wake());
        assert!(ActionReason::PowerConnected.is_manual_wake());
        assert!(!ActionReason::AlarmStartup.is_manual_wake());
        assert!(!ActionReason::Reboot.is_manual_wake());
    }

    #[test]
    fn shutdown_reasons() {
        assert!(ActionReason::LowVoltage.demands_shutdown());
        assert!(ActionReason::OverTemperature.demands_shutdown());
        assert!(ActionReason::AlarmShutdown.demands_shutdown());
        assert!(!ActionReason::BelowTemperature.demands_shutdown());
    }
}
