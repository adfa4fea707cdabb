use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use embedded_hal::i2c::Error as _;
use embedded_hal::i2c::I2c;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use super::{ActionReason, PowerManager};
use crate::alarm::{resolve_next_fire, AlarmField, AlarmSet};
use crate::bcd::{bcd_to_bin, bin_to_bcd};
use crate::{Error, Result, Timestamp};

/// Default I2C address of the power controller
pub const DEFAULT_ADDRESS: u8 = 0x08;

/// Identity register value of supported firmware
pub const FIRMWARE_ID: u8 = 0x26;

/// Alarm flag in RTC control register 2
const CTRL2_ALARM_FLAG: u8 = 0b0100_0000;

/// Register map of the power controller firmware
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // Identity and status (read only)
    Id = 0,
    VoltageInInt = 1,
    VoltageInDec = 2,
    VoltageOutInt = 3,
    VoltageOutDec = 4,
    CurrentOutInt = 5,
    CurrentOutDec = 6,
    PowerMode = 7,
    LowVoltageShutdown = 8,
    Alarm1Triggered = 9,
    Alarm2Triggered = 10,
    ActionReason = 11,
    FirmwareRevision = 12,

    // Configuration
    Address = 16,
    DefaultOn = 17,
    PulseInterval = 18,
    LowVoltage = 19,
    BlinkLed = 20,
    PowerCutDelay = 21,
    RecoveryVoltage = 22,
    DummyLoad = 23,
    AdjustVin = 24,
    AdjustVout = 25,
    AdjustIout = 26,

    // Startup alarm
    StartupSecond = 27,
    StartupMinute = 28,
    StartupHour = 29,
    StartupDay = 30,
    StartupWeekday = 31,

    // Shutdown alarm
    ShutdownSecond = 32,
    ShutdownMinute = 33,
    ShutdownHour = 34,
    ShutdownDay = 35,
    ShutdownWeekday = 36,

    RtcOffsetConf = 37,
    RtcEnableTc = 38,
    FlagAlarm1 = 39,
    FlagAlarm2 = 40,
    IgnorePowerMode = 41,
    IgnoreLowVoltageShutdown = 42,
    BelowTempAction = 43,
    BelowTempPoint = 44,
    OverTempAction = 45,
    OverTempPoint = 46,
    DefaultOnDelay = 47,
    Misc = 48,
    GuaranteedWake = 49,

    // Temperature sensor
    Lm75bTemperature = 50,
    Lm75bConf = 51,
    Lm75bThyst = 52,
    Lm75bTos = 53,

    // RTC
    RtcCtrl1 = 54,
    RtcCtrl2 = 55,
    RtcOffset = 56,
    RtcRamByte = 57,
    RtcSeconds = 58,
    RtcMinutes = 59,
    RtcHours = 60,
    RtcDays = 61,
    RtcWeekdays = 62,
    RtcMonths = 63,
    RtcYears = 64,
    RtcSecondAlarm = 65,
    RtcMinuteAlarm = 66,
    RtcHourAlarm = 67,
    RtcDayAlarm = 68,
    RtcWeekdayAlarm = 69,
    RtcTimerValue = 70,
    RtcTimerMode = 71,
}

/// Which of the two firmware alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmSlot {
    Startup,
    Shutdown,
}

impl AlarmSlot {
    /// Registers as (day, weekday, hour, minute, second)
    fn registers(self) -> [Register; 5] {
        match self {
            AlarmSlot::Startup => [
                Register::StartupDay,
                Register::StartupWeekday,
                Register::StartupHour,
                Register::StartupMinute,
                Register::StartupSecond,
            ],
            AlarmSlot::Shutdown => [
                Register::ShutdownDay,
                Register::ShutdownWeekday,
                Register::ShutdownHour,
                Register::ShutdownMinute,
                Register::ShutdownSecond,
            ],
        }
    }
}

/// Power controller HAT reached over I2C
pub struct RegisterPowerManager<I2C> {
    bus: I2C,
    address: u8,
}

impl<I2C: I2c> RegisterPowerManager<I2C> {
    /// Connects to the controller and verifies its firmware identity
    #[instrument(skip(bus))]
    pub fn new(bus: I2C, address: u8) -> Result<Self> {
        let mut device = Self { bus, address };

        let firmware_id = device.firmware_id().map_err(|_| {
            Error::Connectivity(format!(
                "error reading address {:#04x}, check device connection",
                address
            ))
        })?;
        if firmware_id != FIRMWARE_ID {
            return Err(Error::Connectivity(format!(
                "unknown firmware id (got {:#04x}, expected {:#04x})",
                firmware_id, FIRMWARE_ID
            )));
        }

        let revision = device.firmware_revision()?;
        info!(
            "Power controller probed successfully, id: {:#04x}, revision {:#04x}",
            firmware_id, revision
        );
        Ok(device)
    }

    fn read(&mut self, register: Register) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.bus
            .write_read(self.address, &[register as u8], &mut buf)
            .map_err(|e| Error::Register {
                register: register as u8,
                reason: format!("{:?}", e.kind()),
            })?;
        trace!("Read {:?} = {:#04x}", register, buf[0]);
        Ok(buf[0])
    }

    fn write(&mut self, register: Register, value: u8) -> Result<()> {
        trace!("Write {:?} = {:#04x}", register, value);
        self.bus
            .write(self.address, &[register as u8, value])
            .map_err(|e| Error::Register {
                register: register as u8,
                reason: format!("{:?}", e.kind()),
            })
    }

    fn read_bcd(&mut self, register: Register, mask: u8) -> Result<u8> {
        Ok(bcd_to_bin(self.read(register)? & mask))
    }

    fn write_bcd(&mut self, register: Register, value: u8) -> Result<()> {
        self.write(register, bin_to_bcd(value))
    }

    /// Firmware identity, [`FIRMWARE_ID`] on supported hardware
    pub fn firmware_id(&mut self) -> Result<u8> {
        self.read(Register::Id)
    }

    pub fn firmware_revision(&mut self) -> Result<u8> {
        self.read(Register::FirmwareRevision)
    }

    /// RTC control registers 1 and 2
    pub fn rtc_control(&mut self) -> Result<(u8, u8)> {
        Ok((self.read(Register::RtcCtrl1)?, self.read(Register::RtcCtrl2)?))
    }

    /// Power the board as soon as input power is present
    pub fn set_default_on(&mut self, enabled: bool) -> Result<()> {
        self.write(Register::DefaultOn, u8::from(enabled))
    }

    /// Delay before default-on kicks in (firmware units)
    pub fn set_default_on_delay(&mut self, value: u8) -> Result<()> {
        self.write(Register::DefaultOnDelay, value)
    }

    /// Time between shutdown signal and power cut, clamped to 25 seconds
    pub fn set_power_cut_delay(&mut self, delay: Duration) -> Result<()> {
        let tenths = (delay.as_millis() / 100).min(250) as u8;
        self.write(Register::PowerCutDelay, tenths)
    }

    /// Reads the five registers of an alarm
    #[instrument(skip(self))]
    fn read_alarm(&mut self, slot: AlarmSlot) -> Result<AlarmSet> {
        let [day, weekday, hour, minute, second] = slot.registers();
        let set = AlarmSet {
            day: AlarmField::from_register(self.read_bcd(day, 0xff)?),
            weekday: AlarmField::from_register(self.read_bcd(weekday, 0xff)?),
            hour: AlarmField::from_register(self.read_bcd(hour, 0xff)?),
            minute: AlarmField::from_register(self.read_bcd(minute, 0xff)?),
            second: AlarmField::from_register(self.read_bcd(second, 0xff)?),
        };
        debug!("{:?} alarm registers: {}", slot, set);
        Ok(set)
    }

    /// Writes all five registers of an alarm
    #[instrument(skip(self))]
    fn write_alarm(&mut self, slot: AlarmSlot, set: AlarmSet) -> Result<()> {
        let [day, weekday, hour, minute, second] = slot.registers();
        self.write_bcd(day, set.day.to_register())?;
        self.write_bcd(weekday, set.weekday.to_register())?;
        self.write_bcd(hour, set.hour.to_register())?;
        self.write_bcd(minute, set.minute.to_register())?;
        self.write_bcd(second, set.second.to_register())?;
        debug!("{:?} alarm set to {}", slot, set);
        Ok(())
    }

    fn arm(&mut self, slot: AlarmSlot, ts: Option<Timestamp>) -> Result<()> {
        let Some(ts) = ts else {
            return self.write_alarm(slot, AlarmSet::disabled());
        };

        if ts < self.device_time()? {
            warn!("{:?} time {} is in the past", slot, ts);
        }
        self.write_alarm(slot, AlarmSet::at(ts))
    }

    fn next_fire(&mut self, slot: AlarmSlot) -> Result<Option<Timestamp>> {
        let set = self.read_alarm(slot)?;
        let now = self.device_time()?;
        Ok(resolve_next_fire(&set, now))
    }
}

impl<I2C: I2c> PowerManager for RegisterPowerManager<I2C> {
    #[instrument(skip(self))]
    fn device_time(&mut self) -> Result<Timestamp> {
        let year = 2000 + i32::from(self.read_bcd(Register::RtcYears, 0xff)?);
        let month = self.read_bcd(Register::RtcMonths, 0x1f)?;
        let day = self.read_bcd(Register::RtcDays, 0x3f)?;
        let hour = self.read_bcd(Register::RtcHours, 0x3f)?;
        let minute = self.read_bcd(Register::RtcMinutes, 0x7f)?;
        let second = self.read_bcd(Register::RtcSeconds, 0x7f)?;

        let naive = NaiveDate::from_ymd_opt(year, month.into(), day.into())
            .and_then(|d| d.and_hms_opt(hour.into(), minute.into(), second.into()))
            .ok_or(Error::ClockUnset)?;
        Ok(Utc.from_utc_datetime(&naive))
    }

    #[instrument(skip(self))]
    fn set_device_time(&mut self, ts: Timestamp) -> Result<()> {
        let year = ts.year() - 2000;
        if !(0..100).contains(&year) {
            return Err(Error::Unsupported("RTC only stores years 2000-2099"));
        }
        self.write_bcd(Register::RtcYears, year as u8)?;
        self.write_bcd(Register::RtcMonths, ts.month() as u8)?;
        self.write_bcd(
            Register::RtcWeekdays,
            ts.weekday().num_days_from_monday() as u8,
        )?;
        self.write_bcd(Register::RtcDays, ts.day() as u8)?;
        self.write_bcd(Register::RtcHours, ts.hour() as u8)?;
        self.write_bcd(Register::RtcMinutes, ts.minute() as u8)?;
        self.write_bcd(Register::RtcSeconds, ts.second() as u8)?;
        info!("RTC set to {}", ts);
        Ok(())
    }

    fn set_startup(&mut self, ts: Option<Timestamp>) -> Result<()> {
        self.arm(AlarmSlot::Startup, ts)
    }

    fn get_startup(&mut self) -> Result<Option<Timestamp>> {
        self.next_fire(AlarmSlot::Startup)
    }

    fn set_shutdown(&mut self, ts: Option<Timestamp>) -> Result<()> {
        self.arm(AlarmSlot::Shutdown, ts)
    }

    fn get_shutdown(&mut self) -> Result<Option<Timestamp>> {
        self.next_fire(AlarmSlot::Shutdown)
    }

    #[instrument(skip(self))]
    fn clear_alarm_flags(&mut self) -> Result<()> {
        let ctrl2 = self.read(Register::RtcCtrl2)?;
        self.write(Register::RtcCtrl2, ctrl2 & !CTRL2_ALARM_FLAG)?;
        self.write(Register::FlagAlarm1, 0)?;
        self.write(Register::FlagAlarm2, 0)?;
        debug!("Alarm flags cleared");
        Ok(())
    }

    fn power_on_reason(&mut self) -> Result<ActionReason> {
        Ok(ActionReason::from_code(self.read(Register::ActionReason)?))
    }

    fn prepare_for_daemon(&mut self) -> Result<()> {
        self.set_default_on(true)?;
        self.set_default_on_delay(1)?;
        self.set_power_cut_delay(Duration::from_secs(25))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug)]
    struct BusFault;

    impl embedded_hal::i2c::Error for BusFault {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// In-memory register file answering at one address
    #[derive(Clone)]
    struct FakeBus {
        regs: Rc<RefCell<[u8; 72]>>,
        failing: Rc<RefCell<bool>>,
        address: u8,
    }

    impl FakeBus {
        fn new() -> Self {
            let bus = Self {
                regs: Rc::new(RefCell::new([0u8; 72])),
                failing: Rc::new(RefCell::new(false)),
                address: DEFAULT_ADDRESS,
            };
            bus.set(Register::Id, FIRMWARE_ID);
            bus.set(Register::FirmwareRevision, 0x03);
            bus
        }

        fn set(&self, register: Register, value: u8) {
            self.regs.borrow_mut()[register as usize] = value;
        }

        fn get(&self, register: Register) -> u8 {
            self.regs.borrow()[register as usize]
        }

        fn set_clock(&self, y: u8, mo: u8, d: u8, h: u8, mi: u8, s: u8) {
            self.set(Register::RtcYears, bin_to_bcd(y));
            self.set(Register::RtcMonths, bin_to_bcd(mo));
            self.set(Register::RtcDays, bin_to_bcd(d));
            self.set(Register::RtcHours, bin_to_bcd(h));
            self.set(Register::RtcMinutes, bin_to_bcd(mi));
            self.set(Register::RtcSeconds, bin_to_bcd(s));
        }
    }

    impl ErrorType for FakeBus {
        type Error = BusFault;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> std::result::Result<(), Self::Error> {
            if *self.failing.borrow() || address != self.address {
                return Err(BusFault);
            }
            let mut regs = self.regs.borrow_mut();
            let mut pointer = 0usize;
            for op in operations.iter_mut() {
                match op {
                    Operation::Write(bytes) => {
                        let (first, rest) = bytes.split_first().ok_or(BusFault)?;
                        pointer = usize::from(*first);
                        for b in rest {
                            regs[pointer] = *b;
                            pointer += 1;
                        }
                    }
                    Operation::Read(buf) => {
                        for b in buf.iter_mut() {
                            *b = regs[pointer];
                            pointer += 1;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    fn connected() -> (FakeBus, RegisterPowerManager<FakeBus>) {
        let bus = FakeBus::new();
        bus.set_clock(24, 6, 1, 9, 0, 0);
        let device = RegisterPowerManager::new(bus.clone(), DEFAULT_ADDRESS).unwrap();
        (bus, device)
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_unknown_firmware() {
        let bus = FakeBus::new();
        bus.set(Register::Id, 0x22);
        let err = RegisterPowerManager::new(bus, DEFAULT_ADDRESS).err().unwrap();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn missing_device_is_a_connectivity_error() {
        let bus = FakeBus::new();
        let err = RegisterPowerManager::new(bus, 0x09).err().unwrap();
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[test]
    fn reads_bcd_clock() {
        let (bus, mut device) = connected();
        bus.set_clock(25, 12, 31, 23, 59, 58);
        assert_eq!(device.device_time().unwrap(), utc(2025, 12, 31, 23, 59, 58));
    }

    #[test]
    fn zeroed_clock_is_unset() {
        let (bus, mut device) = connected();
        bus.set_clock(0, 0, 0, 0, 0, 0);
        assert!(matches!(device.device_time(), Err(Error::ClockUnset)));
    }

    #[test]
    fn writes_clock_registers() {
        let (bus, mut device) = connected();
        device.set_device_time(utc(2026, 10, 16, 7, 8, 9)).unwrap();
        assert_eq!(bus.get(Register::RtcYears), 0x26);
        assert_eq!(bus.get(Register::RtcMonths), 0x10);
        assert_eq!(bus.get(Register::RtcDays), 0x16);
        // 2026-10-16 is a Friday
        assert_eq!(bus.get(Register::RtcWeekdays), 0x04);
        assert_eq!(device.device_time().unwrap(), utc(2026, 10, 16, 7, 8, 9));
    }

    #[test]
    fn startup_alarm_round_trip() {
        let (bus, mut device) = connected();
        let target = utc(2024, 6, 2, 7, 30, 15);
        device.set_startup(Some(target)).unwrap();

        assert_eq!(bus.get(Register::StartupDay), 0x02);
        assert_eq!(bus.get(Register::StartupWeekday), 0x80);
        assert_eq!(bus.get(Register::StartupHour), 0x07);
        assert_eq!(bus.get(Register::StartupMinute), 0x30);
        assert_eq!(bus.get(Register::StartupSecond), 0x15);
        assert_eq!(device.get_startup().unwrap(), Some(target));
    }

    #[test]
    fn past_alarm_is_still_written() {
        let (_bus, mut device) = connected();
        let past = utc(2024, 6, 1, 8, 0, 0);
        device.set_shutdown(Some(past)).unwrap();
        // fires again next month on the same day
        assert_eq!(device.get_shutdown().unwrap(), Some(utc(2024, 7, 1, 8, 0, 0)));
    }

    #[test]
    fn cleared_alarm_is_all_wildcards() {
        let (bus, mut device) = connected();
        device.set_shutdown(Some(utc(2024, 6, 1, 12, 0, 0))).unwrap();
        device.set_shutdown(None).unwrap();
        for reg in AlarmSlot::Shutdown.registers() {
            assert_eq!(bus.get(reg), 0x80, "{reg:?}");
        }
        assert_eq!(device.get_shutdown().unwrap(), None);
    }

    #[test]
    fn day_zero_alarm_reads_as_disabled() {
        let (bus, mut device) = connected();
        bus.set(Register::StartupHour, 0x07);
        assert_eq!(device.get_startup().unwrap(), None);
    }

    #[test]
    fn clear_flags_only_touches_alarm_bit() {
        let (bus, mut device) = connected();
        bus.set(Register::RtcCtrl2, 0b0110_0001);
        bus.set(Register::FlagAlarm1, 1);
        bus.set(Register::FlagAlarm2, 1);
        device.clear_alarm_flags().unwrap();
        assert_eq!(bus.get(Register::RtcCtrl2), 0b0010_0001);
        assert_eq!(bus.get(Register::FlagAlarm1), 0);
        assert_eq!(bus.get(Register::FlagAlarm2), 0);
    }

    #[test]
    fn action_reason_decoding() {
        let (bus, mut device) = connected();
        bus.set(Register::ActionReason, 0x04);
        assert_eq!(device.power_on_reason().unwrap(), ActionReason::LowVoltage);
        bus.set(Register::ActionReason, 0x42);
        assert_eq!(device.power_on_reason().unwrap(), ActionReason::NotAvailable);
    }

    #[test]
    fn daemon_defaults() {
        let (bus, mut device) = connected();
        device.prepare_for_daemon().unwrap();
        assert_eq!(bus.get(Register::DefaultOn), 1);
        assert_eq!(bus.get(Register::DefaultOnDelay), 1);
        assert_eq!(bus.get(Register::PowerCutDelay), 250);
    }

    #[test]
    fn bus_failure_surfaces() {
        let (bus, mut device) = connected();
        *bus.failing.borrow_mut() = true;
        let err = device.set_startup(None).err().unwrap();
        assert!(matches!(
            err,
            Error::Register {
                register: 30,
                ..
            }
        ));
    }
}
