use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

use super::{ActionReason, PowerManager};
use crate::{Error, Result, Timestamp};

/// Sysfs directory of the onboard RTC
pub const DEFAULT_RTC_PATH: &str = "/sys/class/rtc/rtc0";

/// Onboard RTC driven through the kernel's sysfs wake alarm
///
/// The wake alarm is a single absolute Unix timestamp. The shutdown time has
/// no hardware counterpart and is only remembered here.
#[derive(Debug)]
pub struct SysfsPowerManager {
    root: PathBuf,
    shutdown: Option<Timestamp>,
}

impl SysfsPowerManager {
    /// Opens the RTC directory, which must offer a `wakealarm` file
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let manager = Self {
            root,
            shutdown: None,
        };
        if !manager.wakealarm_path().exists() {
            return Err(Error::Connectivity(format!(
                "RTC wakealarm not available at {}, ensure the onboard RTC is enabled",
                manager.wakealarm_path().display()
            )));
        }
        info!("Onboard RTC interface initialized at {}", manager.root.display());
        Ok(manager)
    }

    fn wakealarm_path(&self) -> PathBuf {
        self.root.join("wakealarm")
    }

    fn read_attribute(&self, name: &str) -> Result<String> {
        Ok(fs::read_to_string(self.root.join(name))?.trim().to_string())
    }

    /// Currently armed wake alarm as a Unix timestamp
    fn armed_alarm(&self) -> Result<Option<i64>> {
        let raw = self.read_attribute("wakealarm")?;
        if raw.is_empty() || raw == "0" {
            return Ok(None);
        }
        match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!("Unreadable wake alarm '{}': {}", raw, e);
                Ok(None)
            }
        }
    }

    fn write_alarm(&self, value: &str) -> Result<()> {
        fs::write(self.wakealarm_path(), value)?;
        Ok(())
    }
}

impl PowerManager for SysfsPowerManager {
    fn device_time(&mut self) -> Result<Timestamp> {
        let date = self.read_attribute("date")?;
        let time = self.read_attribute("time")?;
        let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
            .map_err(|e| {
                warn!("Unexpected RTC date/time format '{} {}': {}", date, time, e);
                Error::ClockUnset
            })?;
        Ok(Utc.from_utc_datetime(&naive))
    }

    fn set_device_time(&mut self, _ts: Timestamp) -> Result<()> {
        Err(Error::Unsupported("sysfs RTC date and time are read-only"))
    }

    #[instrument(skip(self))]
    fn set_startup(&mut self, ts: Option<Timestamp>) -> Result<()> {
        let Some(ts) = ts else {
            self.write_alarm("0")?;
            debug!("Wake alarm cleared");
            return Ok(());
        };

        if ts < Utc::now() {
            warn!("Wake time is in the past: {}", ts);
        }

        let wake = ts.timestamp();
        if self.armed_alarm().ok().flatten() == Some(wake) {
            debug!("Wake alarm already set to {} ({})", ts, wake);
            return Ok(());
        }

        // the kernel refuses a new alarm while another one is armed
        if let Err(e) = self.write_alarm("0") {
            warn!("Failed to clear existing alarm before setting new one: {}", e);
        }
        self.write_alarm(&wake.to_string())?;
        info!("Wake alarm set for {} ({})", ts, wake);
        Ok(())
    }

    fn get_startup(&mut self) -> Result<Option<Timestamp>> {
        Ok(self
            .armed_alarm()?
            .and_then(|secs| DateTime::from_timestamp(secs, 0)))
    }

    fn set_shutdown(&mut self, ts: Option<Timestamp>) -> Result<()> {
        if let Some(ts) = ts {
            if ts < Utc::now() {
                warn!("Shutdown time is in the past: {}", ts);
            }
        }
        self.shutdown = ts;
        Ok(())
    }

    fn get_shutdown(&mut self) -> Result<Option<Timestamp>> {
        Ok(self.shutdown)
    }

    fn clear_alarm_flags(&mut self) -> Result<()> {
        Ok(())
    }

    fn power_on_reason(&mut self) -> Result<ActionReason> {
        Ok(ActionReason::NotAvailable)
    }
}
