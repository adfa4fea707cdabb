use chrono::{NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;
use sunrise::{Coordinates, SolarDay, SolarEvent};
use tracing::trace;

use super::ScheduleEntry;
use crate::config::parse_clock_duration;
use crate::{Error, Result, Timestamp};

/// Sunrise and sunset instants for a calendar date
pub trait SolarEvents: fmt::Debug + Send + Sync {
    fn sunrise(&self, date: NaiveDate) -> Option<Timestamp>;
    fn sunset(&self, date: NaiveDate) -> Option<Timestamp>;
}

/// Astronomical sunrise and sunset at a fixed location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunCalculator {
    latitude: f64,
    longitude: f64,
}

impl SunCalculator {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn event(&self, date: NaiveDate, event: SolarEvent) -> Option<Timestamp> {
        let coordinates: Option<Coordinates> =
            Coordinates::new(self.latitude, self.longitude).into();
        SolarDay::new(coordinates?, date).event_time(event).into()
    }
}

impl SolarEvents for SunCalculator {
    fn sunrise(&self, date: NaiveDate) -> Option<Timestamp> {
        self.event(date, SolarEvent::Sunrise)
    }

    fn sunset(&self, date: NaiveDate) -> Option<Timestamp> {
        self.event(date, SolarEvent::Sunset)
    }
}

/// A daily boundary, either wall-clock or relative to the sun
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    /// Local wall-clock time
    At(NaiveTime),
    /// Midnight closing the day, written `23:59` or `24:00`
    EndOfDay,
    /// Sunrise shifted by an offset
    Sunrise(TimeDelta),
    /// Sunset shifted by an offset
    Sunset(TimeDelta),
}

impl TimeExpr {
    /// Parses `HH:MM`, `sunrise`, `sunset+HH:MM` or `sunrise-HH:MM`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim().to_ascii_lowercase();
        if let Some(offset) = text.strip_prefix("sunrise") {
            return Ok(TimeExpr::Sunrise(parse_offset(offset)?));
        }
        if let Some(offset) = text.strip_prefix("sunset") {
            return Ok(TimeExpr::Sunset(parse_offset(offset)?));
        }
        if text == "24:00" {
            return Ok(TimeExpr::EndOfDay);
        }
        NaiveTime::parse_from_str(&text, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M:%S"))
            .map(TimeExpr::At)
            .map_err(|e| Error::Config(format!("Invalid time '{text}': {e}")))
    }

    /// Like [`TimeExpr::parse`], but `23:59` closes the whole day
    pub fn parse_stop(text: &str) -> Result<Self> {
        match Self::parse(text)? {
            TimeExpr::At(t) if t == end_of_day_marker() => Ok(TimeExpr::EndOfDay),
            other => Ok(other),
        }
    }

    /// Needs a location to be evaluated
    pub fn is_relative(&self) -> bool {
        matches!(self, TimeExpr::Sunrise(_) | TimeExpr::Sunset(_))
    }

    /// Concrete instant on the local `date`
    fn resolve<Z: TimeZone>(
        &self,
        date: NaiveDate,
        zone: &Z,
        solar: Option<&dyn SolarEvents>,
    ) -> Option<Timestamp> {
        match self {
            TimeExpr::At(time) => local_instant(zone, date, *time),
            TimeExpr::EndOfDay => local_instant(zone, date.succ_opt()?, NaiveTime::MIN),
            TimeExpr::Sunrise(offset) => Some(solar?.sunrise(date)? + *offset),
            TimeExpr::Sunset(offset) => Some(solar?.sunset(date)? + *offset),
        }
    }
}

impl fmt::Display for TimeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn offset(f: &mut fmt::Formatter<'_>, delta: &TimeDelta) -> fmt::Result {
            if delta.is_zero() {
                return Ok(());
            }
            let sign = if *delta < TimeDelta::zero() { '-' } else { '+' };
            let minutes = delta.num_minutes().abs();
            write!(f, "{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
        }

        match self {
            TimeExpr::At(time) => write!(f, "{}", time.format("%H:%M")),
            TimeExpr::EndOfDay => f.write_str("24:00"),
            TimeExpr::Sunrise(delta) => {
                f.write_str("sunrise")?;
                offset(f, delta)
            }
            TimeExpr::Sunset(delta) => {
                f.write_str("sunset")?;
                offset(f, delta)
            }
        }
    }
}

fn end_of_day_marker() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

fn parse_offset(text: &str) -> Result<TimeDelta> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(TimeDelta::zero());
    }
    let (negative, clock) = match (text.strip_prefix('+'), text.strip_prefix('-')) {
        (Some(rest), _) => (false, rest),
        (_, Some(rest)) => (true, rest),
        _ => return Err(Error::Config(format!("Invalid offset '{text}'"))),
    };
    let delta = parse_clock_duration(clock)
        .and_then(|d| TimeDelta::from_std(d).ok())
        .ok_or_else(|| Error::Config(format!("Invalid offset '{text}'")))?;
    Ok(if negative { -delta } else { delta })
}

/// Maps local wall-clock time to an instant
///
/// Ambiguous times (clocks turned back) pick the earlier instant. Times that
/// do not exist (clocks turned forward) move to the first valid minute after.
fn local_instant<Z: TimeZone>(zone: &Z, date: NaiveDate, time: NaiveTime) -> Option<Timestamp> {
    let naive = date.and_time(time);
    zone.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            (1..=180).find_map(|minutes| {
                zone.from_local_datetime(&(naive + TimeDelta::minutes(minutes)))
                    .earliest()
            })
        })
        .map(|t| t.with_timezone(&Utc))
}

/// A window recurring every local day
///
/// The window opened on day D is `[start(D), stop)`, where `stop` is taken on
/// D when it falls after the start and on D+1 otherwise.
#[derive(Debug, Clone)]
pub struct DailyWindow<Z: TimeZone> {
    name: String,
    start: TimeExpr,
    stop: TimeExpr,
    zone: Z,
    solar: Option<Arc<dyn SolarEvents>>,
}

impl<Z: TimeZone> DailyWindow<Z> {
    /// Relative boundaries require `solar`
    pub fn new(
        name: &str,
        start: &str,
        stop: &str,
        zone: Z,
        solar: Option<Arc<dyn SolarEvents>>,
    ) -> Result<Self> {
        let start = TimeExpr::parse(start)?;
        let stop = TimeExpr::parse_stop(stop)?;
        if start == TimeExpr::EndOfDay {
            return Err(Error::Config(format!("{name}: window cannot start at 24:00")));
        }
        if solar.is_none() && (start.is_relative() || stop.is_relative()) {
            return Err(Error::Config(format!(
                "{name}: sunrise/sunset times need a location"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            start,
            stop,
            zone,
            solar,
        })
    }

    /// Window opened on the local `date`
    fn interval(&self, date: NaiveDate) -> Option<(Timestamp, Timestamp)> {
        let solar = self.solar.as_deref();
        let start = self.start.resolve(date, &self.zone, solar)?;
        let stop = match self.stop.resolve(date, &self.zone, solar)? {
            same_day if same_day > start => same_day,
            _ => self.stop.resolve(date.succ_opt()?, &self.zone, solar)?,
        };
        (stop > start).then_some((start, stop))
    }

    /// Windows opened from two days before to two days after `t`, by start
    fn intervals_around(&self, t: Timestamp) -> Vec<(Timestamp, Timestamp)> {
        let today = t.with_timezone(&self.zone).date_naive();
        (-2..=2)
            .filter_map(|days| today.checked_add_signed(TimeDelta::days(days)))
            .filter_map(|date| self.interval(date))
            .collect()
    }

    fn previous(&self, t: Timestamp) -> Option<(Timestamp, Timestamp)> {
        self.intervals_around(t)
            .into_iter()
            .filter(|(start, _)| *start <= t)
            .max_by_key(|(start, _)| *start)
    }

    fn next(&self, t: Timestamp) -> Option<(Timestamp, Timestamp)> {
        self.intervals_around(t)
            .into_iter()
            .filter(|(start, _)| *start > t)
            .min_by_key(|(start, _)| *start)
    }
}

impl<Z> ScheduleEntry for DailyWindow<Z>
where
    Z: TimeZone + fmt::Debug + Send,
{
    fn active(&self, t: Timestamp) -> bool {
        let active = self
            .intervals_around(t)
            .iter()
            .any(|(start, stop)| *start <= t && t < *stop);
        trace!("{} active at {}: {}", self.name, t, active);
        active
    }

    fn next_start(&self, t: Timestamp) -> Option<Timestamp> {
        self.next(t).map(|(start, _)| start)
    }

    fn prev_start(&self, t: Timestamp) -> Option<Timestamp> {
        self.previous(t).map(|(start, _)| start)
    }

    fn next_stop(&self, t: Timestamp) -> Option<Timestamp> {
        self.next(t).map(|(_, stop)| stop)
    }

    fn prev_stop(&self, t: Timestamp) -> Option<Timestamp> {
        self.previous(t).map(|(_, stop)| stop)
    }
}

impl<Z: TimeZone> fmt::Display for DailyWindow<Z> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} - {})", self.name, self.start, self.stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    /// Sunrise at 06:00 and sunset at 20:00 UTC every day
    #[derive(Debug)]
    struct FixedSun;

    impl SolarEvents for FixedSun {
        fn sunrise(&self, date: NaiveDate) -> Option<Timestamp> {
            Some(Utc.from_utc_datetime(&date.and_hms_opt(6, 0, 0)?))
        }

        fn sunset(&self, date: NaiveDate) -> Option<Timestamp> {
            Some(Utc.from_utc_datetime(&date.and_hms_opt(20, 0, 0)?))
        }
    }

    fn window(start: &str, stop: &str) -> DailyWindow<Tz> {
        DailyWindow::new("test", start, stop, Tz::UTC, Some(Arc::new(FixedSun))).unwrap()
    }

    #[test]
    fn parses_expressions() {
        assert_eq!(
            TimeExpr::parse("08:30").unwrap(),
            TimeExpr::At(NaiveTime::from_hms_opt(8, 30, 0).unwrap())
        );
        assert_eq!(
            TimeExpr::parse("Sunrise-01:00").unwrap(),
            TimeExpr::Sunrise(TimeDelta::hours(-1))
        );
        assert_eq!(
            TimeExpr::parse("sunset+00:45").unwrap(),
            TimeExpr::Sunset(TimeDelta::minutes(45))
        );
        assert_eq!(
            TimeExpr::parse("sunset").unwrap(),
            TimeExpr::Sunset(TimeDelta::zero())
        );
        assert_eq!(TimeExpr::parse_stop("23:59").unwrap(), TimeExpr::EndOfDay);
        assert_eq!(TimeExpr::parse("24:00").unwrap(), TimeExpr::EndOfDay);
        assert!(TimeExpr::parse("25:00").is_err());
        assert!(TimeExpr::parse("sunrise*02:00").is_err());
        assert!(TimeExpr::parse("noon").is_err());
    }

    #[test]
    fn display_round_trips_notation() {
        assert_eq!(TimeExpr::parse("sunrise-01:30").unwrap().to_string(), "sunrise-01:30");
        assert_eq!(TimeExpr::parse("07:05").unwrap().to_string(), "07:05");
        assert_eq!(window("sunset", "23:59").to_string(), "test (sunset - 24:00)");
    }

    #[test]
    fn relative_entries_need_a_location() {
        let err = DailyWindow::new("dusk", "sunset", "23:00", Tz::UTC, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(DailyWindow::new("fixed", "08:00", "09:00", Tz::UTC, None).is_ok());
    }

    #[test]
    fn same_day_window() {
        let w = window("08:00", "12:00");
        let t = utc(2024, 6, 1, 9, 0);
        assert!(w.active(t));
        assert_eq!(w.prev_start(t), Some(utc(2024, 6, 1, 8, 0)));
        assert_eq!(w.prev_stop(t), Some(utc(2024, 6, 1, 12, 0)));
        assert_eq!(w.next_start(t), Some(utc(2024, 6, 2, 8, 0)));
        assert_eq!(w.next_stop(t), Some(utc(2024, 6, 2, 12, 0)));
        assert!(!w.active(utc(2024, 6, 1, 12, 0)));
        assert!(w.active(utc(2024, 6, 1, 8, 0)));
    }

    #[test]
    fn overnight_window() {
        let w = window("22:00", "06:00");
        let t = utc(2024, 6, 2, 3, 0);
        assert!(w.active(t));
        assert_eq!(w.prev_start(t), Some(utc(2024, 6, 1, 22, 0)));
        assert_eq!(w.prev_stop(t), Some(utc(2024, 6, 2, 6, 0)));
        assert_eq!(w.next_start(t), Some(utc(2024, 6, 2, 22, 0)));
        assert!(!w.active(utc(2024, 6, 2, 12, 0)));
    }

    #[test]
    fn end_of_day_stop() {
        let w = window("18:00", "23:59");
        let t = utc(2024, 6, 1, 23, 59);
        assert!(w.active(t));
        assert_eq!(w.prev_stop(t), Some(utc(2024, 6, 2, 0, 0)));
    }

    #[test]
    fn sun_relative_window() {
        let w = window("sunrise-01:00", "sunset+00:30");
        let t = utc(2024, 6, 1, 5, 30);
        assert!(w.active(t));
        assert_eq!(w.prev_start(t), Some(utc(2024, 6, 1, 5, 0)));
        assert_eq!(w.prev_stop(t), Some(utc(2024, 6, 1, 20, 30)));
        assert!(!w.active(utc(2024, 6, 1, 4, 59)));
    }

    #[test]
    fn local_zone_is_honoured() {
        let w = DailyWindow::new("berlin", "08:00", "12:00", chrono_tz::Europe::Berlin, None)
            .unwrap();
        // CEST is UTC+2 in June
        assert_eq!(w.next_start(utc(2024, 6, 1, 0, 0)), Some(utc(2024, 6, 1, 6, 0)));
    }

    #[test]
    fn clocks_turned_forward() {
        let w = DailyWindow::new("gap", "02:30", "04:00", chrono_tz::Europe::Berlin, None)
            .unwrap();
        // 2024-03-31 02:30 does not exist in Berlin, 03:00 CEST is 01:00 UTC
        assert_eq!(
            w.next_start(utc(2024, 3, 30, 12, 0)),
            Some(utc(2024, 3, 31, 1, 0))
        );
    }

    #[test]
    fn clocks_turned_back() {
        let w = DailyWindow::new("twice", "02:30", "04:00", chrono_tz::Europe::Berlin, None)
            .unwrap();
        // 2024-10-27 02:30 happens twice, the CEST one is 00:30 UTC
        assert_eq!(
            w.next_start(utc(2024, 10, 26, 12, 0)),
            Some(utc(2024, 10, 27, 0, 30))
        );
    }

    #[test]
    fn sun_calculator_orders_events() {
        let sun = SunCalculator::new(50.85318, 8.78735);
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let rise = sun.sunrise(date).unwrap();
        let set = sun.sunset(date).unwrap();
        assert!(rise < set);
        assert_eq!(rise.date_naive(), date);
    }
}
