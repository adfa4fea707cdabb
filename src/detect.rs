/*!
 # Hardware detection

 Picks the power management backend: an explicit override first, then the
 I2C power controller, then the onboard RTC of boards that carry one.
*/

use clap::{Args, ValueEnum};
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::power::{Register, DEFAULT_ADDRESS, DEFAULT_RTC_PATH, FIRMWARE_ID};
use crate::{Error, Result};

/// Board description exposed by the device tree
pub const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

/// Boards whose onboard RTC can wake them
const ONBOARD_RTC_MODELS: &[&str] = &["Raspberry Pi 5"];

/// Supported power management backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HardwareKind {
    /// Power controller HAT on the I2C bus
    RegisterHat,
    /// Onboard RTC wake alarm through sysfs
    OnboardRtc,
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareKind::RegisterHat => f.write_str("register-hat"),
            HardwareKind::OnboardRtc => f.write_str("onboard-rtc"),
        }
    }
}

/// Where to look for the hardware, shared by both binaries
#[derive(Debug, Clone, Args)]
pub struct HardwareArgs {
    /// I2C bus number of the power controller
    #[arg(long, default_value_t = 1)]
    pub bus: u8,

    /// I2C address of the power controller
    #[arg(long, default_value_t = DEFAULT_ADDRESS)]
    pub addr: u8,

    /// Skip detection and use this backend
    #[arg(long, value_enum)]
    pub hardware: Option<HardwareKind>,

    /// Sysfs directory of the onboard RTC
    #[arg(long, default_value = DEFAULT_RTC_PATH)]
    pub rtc_path: PathBuf,
}

impl HardwareArgs {
    pub fn i2c_path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }

    /// Opens the I2C character device
    pub fn open_bus(&self) -> Result<I2cdev> {
        I2cdev::new(self.i2c_path())
            .map_err(|e| Error::Connectivity(format!("{}: {}", self.i2c_path(), e)))
    }
}

/// Works out which backend is present, `None` if neither is
pub fn detect_hardware(args: &HardwareArgs) -> Option<HardwareKind> {
    if let Some(kind) = args.hardware {
        info!("Using hardware override: {}", kind);
        return Some(kind);
    }

    match args.open_bus() {
        Ok(mut bus) => {
            if probe_register_hat(&mut bus, args.addr) {
                info!("Detected power controller on {}", args.i2c_path());
                return Some(HardwareKind::RegisterHat);
            }
        }
        Err(e) => debug!("I2C bus not available: {}", e),
    }

    if onboard_rtc_present(Path::new(DEVICE_TREE_MODEL), &args.rtc_path) {
        info!("Detected onboard RTC at {}", args.rtc_path.display());
        return Some(HardwareKind::OnboardRtc);
    }

    warn!("No supported power management hardware found");
    None
}

/// Whether the firmware identity register answers with the expected id
pub fn probe_register_hat<I2C: I2c>(bus: &mut I2C, address: u8) -> bool {
    let mut id = [0u8; 1];
    match bus.write_read(address, &[Register::Id as u8], &mut id) {
        Ok(()) if id[0] == FIRMWARE_ID => true,
        Ok(()) => {
            debug!("Device at {:#04x} reports id {:#04x}", address, id[0]);
            false
        }
        Err(e) => {
            debug!("No answer at {:#04x}: {:?}", address, e);
            false
        }
    }
}

/// Whether the board model has a wakeable onboard RTC and the alarm is exposed
pub fn onboard_rtc_present(model_path: &Path, rtc_path: &Path) -> bool {
    let model = match fs::read_to_string(model_path) {
        Ok(model) => model.trim_end_matches('\0').trim().to_string(),
        Err(e) => {
            debug!("Cannot read board model: {}", e);
            return false;
        }
    };
    if !ONBOARD_RTC_MODELS.iter().any(|m| model.contains(m)) {
        debug!("Board '{}' has no supported onboard RTC", model);
        return false;
    }
    rtc_path.join("wakealarm").exists()
}
