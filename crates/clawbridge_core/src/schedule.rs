//! Named recurring time windows.

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDateTime, NaiveTime, Timelike, Utc};
use clawbridge_error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::str::FromStr;

/// All seven weekdays, `0 = Monday .. 6 = Sunday`.
pub const ALL_WEEKDAYS: [u8; 7] = [0, 1, 2, 3, 4, 5, 6];

/// A recurring window on selected weekdays.
///
/// When `end` is earlier than `start` the window crosses midnight. When they
/// are equal the window covers the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct Schedule {
    /// Schedule identifier
    id: String,
    /// Display name
    name: String,
    /// Window start (inclusive)
    #[serde(with = "hh_mm")]
    start: NaiveTime,
    /// Window end (exclusive)
    #[serde(with = "hh_mm")]
    end: NaiveTime,
    /// Allowed weekdays, `0 = Monday`
    #[serde(default = "all_days")]
    days: BTreeSet<u8>,
}

fn all_days() -> BTreeSet<u8> {
    ALL_WEEKDAYS.into_iter().collect()
}

impl Schedule {
    /// Create a schedule. Days outside `0..=6` are dropped; an empty set means every day.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        start: NaiveTime,
        end: NaiveTime,
        days: impl IntoIterator<Item = u8>,
    ) -> Self {
        let mut days: BTreeSet<u8> = days.into_iter().filter(|d| *d <= 6).collect();
        if days.is_empty() {
            days = all_days();
        }
        Self {
            id: id.into(),
            name: name.into(),
            start,
            end,
            days,
        }
    }

    /// Parse an `HH:MM` time of day.
    pub fn parse_time(text: &str) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(text.trim(), "%H:%M")
            .map_err(|e| ConfigError::new(format!("Invalid time '{}': {}", text, e)))
    }

    /// Rename in place.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Move the window in place.
    pub fn set_window(&mut self, start: NaiveTime, end: NaiveTime) {
        self.start = start;
        self.end = end;
    }

    /// Replace the weekday set in place.
    pub fn set_days(&mut self, days: impl IntoIterator<Item = u8>) {
        let days: BTreeSet<u8> = days.into_iter().filter(|d| *d <= 6).collect();
        self.days = if days.is_empty() { all_days() } else { days };
    }

    /// Whether the window is open at the given local wall-clock time.
    pub fn allows(&self, local: NaiveDateTime) -> bool {
        let weekday = local.weekday().num_days_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }
        let now = minutes_of_day(local.time());
        let start = minutes_of_day(self.start);
        let end = minutes_of_day(self.end);
        if start < end {
            start <= now && now < end
        } else if start > end {
            now >= start || now < end
        } else {
            true
        }
    }
}

fn minutes_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Timezone the schedule evaluator reads wall-clock time in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayTimezone {
    /// Host local time
    #[default]
    Local,
    /// Fixed UTC offset
    Fixed(FixedOffset),
}

impl GatewayTimezone {
    /// Convert an instant to local wall-clock time.
    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            GatewayTimezone::Local => instant.with_timezone(&Local).naive_local(),
            GatewayTimezone::Fixed(offset) => instant.with_timezone(offset).naive_local(),
        }
    }
}

impl FromStr for GatewayTimezone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") || trimmed == "auto" {
            return Ok(GatewayTimezone::Local);
        }
        if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
            return Ok(GatewayTimezone::Fixed(FixedOffset::east_opt(0).ok_or_else(|| {
                ConfigError::new("UTC offset out of range")
            })?));
        }
        FixedOffset::from_str(trimmed)
            .map(GatewayTimezone::Fixed)
            .map_err(|e| ConfigError::new(format!("Invalid timezone '{}': {}", s, e)))
    }
}

impl Serialize for GatewayTimezone {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GatewayTimezone::Local => serializer.serialize_str("local"),
            GatewayTimezone::Fixed(offset) => serializer.serialize_str(&offset.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for GatewayTimezone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GatewayTimezone::from_str(&text).map_err(serde::de::Error::custom)
    }
}

mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&text, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        // 2026-10-19 is a Monday
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn window(start: &str, end: &str) -> Schedule {
        Schedule::new(
            "sch_test",
            "test",
            Schedule::parse_time(start).unwrap(),
            Schedule::parse_time(end).unwrap(),
            ALL_WEEKDAYS,
        )
    }

    #[test]
    fn test_wraps_midnight() {
        let night = window("22:00", "06:00");
        assert!(night.allows(at(23, 30)));
        assert!(night.allows(at(2, 0)));
        assert!(!night.allows(at(12, 0)));
    }

    #[test]
    fn test_end_is_exclusive() {
        let office = window("09:00", "17:00");
        assert!(office.allows(at(9, 0)));
        assert!(office.allows(at(16, 59)));
        assert!(!office.allows(at(17, 0)));
    }

    #[test]
    fn test_weekday_filter() {
        let weekend = Schedule::new(
            "sch_weekend",
            "weekend",
            Schedule::parse_time("00:00").unwrap(),
            Schedule::parse_time("00:00").unwrap(),
            [5, 6],
        );
        assert!(!weekend.allows(at(12, 0)));
        let saturday = NaiveDate::from_ymd_opt(2026, 10, 24)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!(weekend.allows(saturday));
    }

    #[test]
    fn test_serde_uses_hh_mm() {
        let night = window("22:00", "06:00");
        let json = serde_json::to_value(&night).unwrap();
        assert_eq!(json["start"], "22:00");
        assert_eq!(json["end"], "06:00");
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, night);
    }

    #[test]
    fn test_timezone_parse() {
        assert_eq!(GatewayTimezone::from_str("local").unwrap(), GatewayTimezone::Local);
        let fixed = GatewayTimezone::from_str("+02:00").unwrap();
        let instant = DateTime::parse_from_rfc3339("2026-10-19T21:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(fixed.to_local(instant), at(23, 30));
        assert!(GatewayTimezone::from_str("mars").is_err());
    }
}
