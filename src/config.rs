/*!
 # Schedule configuration

 The schedule document is YAML:

 ```yaml
 lat: 50.85318
 lon: 8.78735
 tz: Europe/Berlin
 force_on: false
 button_delay: "00:30"
 schedule:
   - name: morning
     start: sunrise-01:00
     stop: "12:00"
   - name: evening
     start: "18:00"
     stop: sunset+01:00
 ```

 Loading never fails. A broken document degrades to an empty one, which the
 scheduler turns into force-on, and broken keys or entries are skipped.
*/

use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static location file, geoclue-2.0 format
pub const DEFAULT_GEOLOCATION_PATH: &str = "/etc/geolocation";

/// How long a manual power-on keeps the board up unless configured
pub const DEFAULT_BUTTON_DELAY: Duration = Duration::from_secs(10 * 60);

/// One entry of the `schedule` list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntryConfig {
    pub name: String,
    pub start: String,
    pub stop: String,
}

/// Parsed schedule document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleConfig {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub tz: Option<String>,
    pub force_on: bool,
    pub button_delay: Option<String>,
    /// `None` when the list is missing or is not a list at all
    pub schedule: Option<Vec<EntryConfig>>,
}

impl ScheduleConfig {
    /// Reads a schedule file, an unreadable file counts as an empty document
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_yaml_str(&text),
            Err(e) => {
                warn!("Cannot read schedule {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_yaml_str(text: &str) -> Self {
        let doc: Value = match serde_yaml::from_str(text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Schedule configuration is not valid YAML: {}", e);
                return Self::default();
            }
        };
        let Value::Mapping(map) = doc else {
            warn!("Schedule configuration is not a mapping");
            return Self::default();
        };
        debug!("{:?}", map);

        Self {
            lat: field(&map, "lat"),
            lon: field(&map, "lon"),
            tz: field(&map, "tz"),
            force_on: map.get("force_on").map_or(false, truthy),
            button_delay: field(&map, "button_delay"),
            schedule: map.get("schedule").and_then(entries),
        }
    }

    /// Configured delay after a manual power-on, `None` disables auto-shutdown
    pub fn button_delay(&self) -> Option<Duration> {
        let delay = match self.button_delay.as_deref().map(parse_clock_duration) {
            Some(Some(delay)) => delay,
            Some(None) => {
                warn!(
                    "Invalid button_delay {:?}, using {:?}",
                    self.button_delay, DEFAULT_BUTTON_DELAY
                );
                DEFAULT_BUTTON_DELAY
            }
            None => DEFAULT_BUTTON_DELAY,
        };
        debug!("Using button delay of {:?}", delay);
        (!delay.is_zero()).then_some(delay)
    }

    /// Named timezone, `None` means the system zone
    pub fn zone(&self) -> Option<Tz> {
        let name = self.tz.as_deref()?;
        match name.parse::<Tz>() {
            Ok(tz) => {
                info!("Using timezone from config: {}", tz);
                Some(tz)
            }
            Err(e) => {
                warn!("Invalid timezone '{}' in config: {}, using system timezone", name, e);
                None
            }
        }
    }

    /// Location from `lat`/`lon`, falling back to the geolocation file
    pub fn location(&self, geolocation: &Path) -> Option<(f64, f64)> {
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            info!("Times relative to {:.5}, {:.5} (from config)", lat, lon);
            return Some((lat, lon));
        }
        let location = parse_geolocation(geolocation)?;
        info!(
            "Times relative to {:.5}, {:.5} (from {})",
            location.0,
            location.1,
            geolocation.display()
        );
        Some(location)
    }
}

fn field<T: DeserializeOwned>(map: &Mapping, key: &str) -> Option<T> {
    let value = map.get(key)?;
    match serde_yaml::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring invalid '{}' in config: {}", key, e);
            None
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        _ => false,
    }
}

fn entries(value: &Value) -> Option<Vec<EntryConfig>> {
    let Value::Sequence(list) = value else {
        warn!("Schedule is not a list");
        return None;
    };
    let parsed = list
        .iter()
        .filter_map(|raw| match serde_yaml::from_value(raw.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Ignoring malformed schedule entry {:?}: {}", raw, e);
                None
            }
        })
        .collect();
    Some(parsed)
}

/// Parses `HH:MM` or `HH:MM:SS`
pub fn parse_clock_duration(text: &str) -> Option<Duration> {
    let parts: Vec<u64> = text
        .trim()
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m] => (*h, *m, 0),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

/// Reads latitude and longitude from a geoclue-2.0 static location file
///
/// The first two meaningful lines hold latitude and longitude; altitude and
/// accuracy may follow and are ignored. `#` starts a comment.
pub fn parse_geolocation(path: &Path) -> Option<(f64, f64)> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            debug!("Geolocation file {} not readable: {}", path.display(), e);
            return None;
        }
    };

    let lines: Vec<&str> = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .collect();
    let [lat, lon, ..] = lines.as_slice() else {
        warn!(
            "Geolocation file {} has insufficient data (need lat/lon)",
            path.display()
        );
        return None;
    };

    let (lat, lon) = match (lat.parse::<f64>(), lon.parse::<f64>()) {
        (Ok(lat), Ok(lon)) => (lat, lon),
        _ => {
            warn!("Failed to parse geolocation file {}", path.display());
            return None;
        }
    };
    if !(-90.0..=90.0).contains(&lat) {
        warn!("Invalid latitude in {}: {} (must be -90 to 90)", path.display(), lat);
        return None;
    }
    if !(-180.0..=180.0).contains(&lon) {
        warn!("Invalid longitude in {}: {} (must be -180 to 180)", path.display(), lon);
        return None;
    }
    debug!("Parsed geolocation from {}: {}, {}", path.display(), lat, lon);
    Some((lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "powersched-geo-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn full_document() {
        let config = ScheduleConfig::from_yaml_str(
            r#"
lat: 50.85318
lon: 8.78735
tz: Europe/Berlin
force_on: false
button_delay: "00:30"
schedule:
  - name: morning
    start: sunrise-01:00
    stop: "12:00"
  - name: evening
    start: "18:00"
    stop: sunset+01:00
"#,
        );
        assert_eq!(config.lat, Some(50.85318));
        assert_eq!(config.tz.as_deref(), Some("Europe/Berlin"));
        assert!(!config.force_on);
        assert_eq!(config.button_delay(), Some(Duration::from_secs(30 * 60)));
        assert_eq!(config.zone(), Some(chrono_tz::Europe::Berlin));
        let schedule = config.schedule.unwrap();
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule[0].start, "sunrise-01:00");
        assert_eq!(schedule[1].name, "evening");
    }

    #[test]
    fn broken_yaml_is_empty_document() {
        let config = ScheduleConfig::from_yaml_str("schedule: [unclosed");
        assert_eq!(config, ScheduleConfig::default());
    }

    #[test]
    fn schedule_that_is_not_a_list() {
        let config = ScheduleConfig::from_yaml_str("schedule: every day\n");
        assert_eq!(config.schedule, None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let config = ScheduleConfig::from_yaml_str(
            "schedule:\n  - {name: ok, start: '08:00', stop: '09:00'}\n  - {name: broken}\n",
        );
        assert_eq!(config.schedule.unwrap().len(), 1);
    }

    #[test]
    fn bad_keys_do_not_poison_the_document() {
        let config = ScheduleConfig::from_yaml_str(
            "lat: north\nforce_on: yes\nschedule:\n  - {name: a, start: '08:00', stop: '09:00'}\n",
        );
        assert_eq!(config.lat, None);
        assert!(config.force_on);
        assert_eq!(config.schedule.unwrap().len(), 1);
    }

    #[test]
    fn button_delay_defaults_and_disable() {
        let mut config = ScheduleConfig::default();
        assert_eq!(config.button_delay(), Some(DEFAULT_BUTTON_DELAY));
        config.button_delay = Some("soon".into());
        assert_eq!(config.button_delay(), Some(DEFAULT_BUTTON_DELAY));
        config.button_delay = Some("00:00".into());
        assert_eq!(config.button_delay(), None);
        config.button_delay = Some("01:02:03".into());
        assert_eq!(config.button_delay(), Some(Duration::from_secs(3723)));
    }

    #[test]
    fn invalid_timezone_falls_back() {
        let config = ScheduleConfig {
            tz: Some("Mars/Olympus_Mons".into()),
            ..Default::default()
        };
        assert_eq!(config.zone(), None);
    }

    #[test]
    fn clock_durations() {
        assert_eq!(parse_clock_duration("00:10"), Some(Duration::from_secs(600)));
        assert_eq!(parse_clock_duration("2:00"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_clock_duration("00:75"), None);
        assert_eq!(parse_clock_duration("10"), None);
        assert_eq!(parse_clock_duration("ab:cd"), None);
    }

    #[test]
    fn geolocation_file_with_comments() {
        let path = scratch_file("# static location\n50.85318\n\n8.78735 # east\n250\n");
        assert_eq!(parse_geolocation(&path), Some((50.85318, 8.78735)));
    }

    #[test]
    fn geolocation_rejects_bad_data() {
        assert_eq!(parse_geolocation(&scratch_file("50.0\n")), None);
        assert_eq!(parse_geolocation(&scratch_file("95.0\n8.0\n")), None);
        assert_eq!(parse_geolocation(&scratch_file("50.0\n-181\n")), None);
        assert_eq!(parse_geolocation(&scratch_file("fifty\n8.0\n")), None);
        assert_eq!(parse_geolocation(Path::new("/nonexistent/geolocation")), None);
    }

    #[test]
    fn config_location_wins_over_file() {
        let path = scratch_file("10.0\n20.0\n");
        let mut config = ScheduleConfig {
            lat: Some(1.0),
            lon: Some(2.0),
            ..Default::default()
        };
        assert_eq!(config.location(&path), Some((1.0, 2.0)));
        config.lon = None;
        assert_eq!(config.location(&path), Some((10.0, 20.0)));
    }
}
