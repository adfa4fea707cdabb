/*!
 # Clock plausibility

 Before trusting the RTC the daemon compares it against the latest time the
 system is known to have reached, taken from files that time services leave
 behind.
*/

use chrono::{NaiveDateTime, TimeZone, Utc};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::{Error, Result, Timestamp};

/// Marker that systemd's time-sync.target waits for
pub const DEFAULT_SYNC_MARKER: &str = "/run/systemd/timesync/synchronized";

/// Files that record a last known good time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSources {
    /// `fake-hwclock` save file, holding `YYYY-MM-DD HH:MM:SS` in UTC
    pub fake_hwclock: PathBuf,
    /// Touched by systemd-timesyncd on each sync
    pub timesyncd_clock: PathBuf,
    /// Rewritten by chrony periodically
    pub chrony_drift: PathBuf,
}

impl Default for TimeSources {
    fn default() -> Self {
        Self {
            fake_hwclock: PathBuf::from("/etc/fake-hwclock.data"),
            timesyncd_clock: PathBuf::from("/var/lib/systemd/timesync/clock"),
            chrony_drift: PathBuf::from("/var/lib/chrony/chrony.drift"),
        }
    }
}

impl TimeSources {
    /// Latest instant recorded by any source
    ///
    /// Missing or unreadable sources are skipped. Fails with
    /// [`Error::NoClockSource`] when none of them is usable.
    pub fn last_known_time(&self) -> Result<Timestamp> {
        let readings = [
            ("fake-hwclock", read_fake_hwclock(&self.fake_hwclock)),
            ("timesyncd", modification_time(&self.timesyncd_clock)),
            ("chrony", modification_time(&self.chrony_drift)),
        ];

        readings
            .into_iter()
            .filter_map(|(source, reading)| match reading {
                Ok(ts) => {
                    debug!("{} time is {}", source, ts);
                    Some(ts)
                }
                Err(e) => {
                    debug!("{} time not available: {}", source, e);
                    None
                }
            })
            .max()
            .ok_or(Error::NoClockSource)
    }
}

fn read_fake_hwclock(path: &Path) -> io::Result<Timestamp> {
    let raw = fs::read_to_string(path)?;
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn modification_time(path: &Path) -> io::Result<Timestamp> {
    Ok(fs::metadata(path)?.modified()?.into())
}

/// Rejects a device clock earlier than the last known good time
pub fn ensure_plausible(device: Timestamp, floor: Timestamp) -> Result<()> {
    if device < floor {
        warn!(
            "RTC is implausible ({}), last known time is {}. Connect to GPS or internet and wait for time sync",
            device, floor
        );
        return Err(Error::ClockImplausible { device, floor });
    }
    Ok(())
}

/// Creates or touches the time synchronization marker
pub fn mark_synchronized(marker: &Path) -> io::Result<()> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(marker)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "powersched-clock-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sources_in(dir: &Path) -> TimeSources {
        TimeSources {
            fake_hwclock: dir.join("fake-hwclock.data"),
            timesyncd_clock: dir.join("clock"),
            chrony_drift: dir.join("chrony.drift"),
        }
    }

    #[test]
    fn no_sources_at_all() {
        let dir = scratch_dir();
        assert!(matches!(
            sources_in(&dir).last_known_time(),
            Err(Error::NoClockSource)
        ));
    }

    #[test]
    fn fake_hwclock_is_utc() {
        let dir = scratch_dir();
        let sources = sources_in(&dir);
        fs::write(&sources.fake_hwclock, "2020-01-02 03:04:05\n").unwrap();
        assert_eq!(
            sources.last_known_time().unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()
        );
    }

    #[test]
    fn newest_source_wins() {
        let dir = scratch_dir();
        let sources = sources_in(&dir);
        fs::write(&sources.fake_hwclock, "2020-01-02 03:04:05\n").unwrap();
        fs::write(&sources.timesyncd_clock, "").unwrap();
        let floor = sources.last_known_time().unwrap();
        assert!(floor > Utc::now() - TimeDelta::minutes(5));
    }

    #[test]
    fn garbage_fake_hwclock_is_skipped() {
        let dir = scratch_dir();
        let sources = sources_in(&dir);
        fs::write(&sources.fake_hwclock, "yesterday\n").unwrap();
        fs::write(&sources.chrony_drift, "1.234 0.5\n").unwrap();
        assert!(sources.last_known_time().is_ok());
    }

    #[test]
    fn plausibility() {
        let floor = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(ensure_plausible(floor, floor).is_ok());
        let err = ensure_plausible(floor - TimeDelta::seconds(1), floor).unwrap_err();
        assert!(matches!(err, Error::ClockImplausible { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn marker_is_created_with_parents() {
        let marker = scratch_dir().join("timesync").join("synchronized");
        mark_synchronized(&marker).unwrap();
        assert!(marker.exists());
        mark_synchronized(&marker).unwrap();
    }
}
