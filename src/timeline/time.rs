// Time normalization for event boundaries
//
// Accepts unix timestamps, aware and naive datetimes, and common text forms.
// Naive values are interpreted in the configured default offset.

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc,
};

use crate::error::{FramewiseError, Result};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const AWARE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    /// Seconds since the unix epoch
    Timestamp(i64),
    Text(String),
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl From<i64> for TimeInput {
    fn from(secs: i64) -> Self {
        TimeInput::Timestamp(secs)
    }
}

impl From<&str> for TimeInput {
    fn from(s: &str) -> Self {
        TimeInput::Text(s.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(s: String) -> Self {
        TimeInput::Text(s)
    }
}

impl From<DateTime<FixedOffset>> for TimeInput {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        TimeInput::Aware(dt)
    }
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(dt: DateTime<Utc>) -> Self {
        TimeInput::Aware(dt.fixed_offset())
    }
}

impl From<NaiveDateTime> for TimeInput {
    fn from(dt: NaiveDateTime) -> Self {
        TimeInput::Naive(dt)
    }
}

impl TimeInput {
    /// Resolve to an aware datetime, attaching `default_offset` to naive values.
    pub fn resolve(&self, default_offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
        match self {
            TimeInput::Timestamp(secs) => DateTime::from_timestamp(*secs, 0)
                .map(|dt| dt.with_timezone(&default_offset))
                .ok_or_else(|| FramewiseError::Input(format!("timestamp out of range: {}", secs))),
            TimeInput::Aware(dt) => Ok(*dt),
            TimeInput::Naive(naive) => Ok(attach(default_offset, naive)),
            TimeInput::Text(text) => parse_text(text.trim(), default_offset),
        }
    }
}

fn attach(offset: FixedOffset, naive: &NaiveDateTime) -> DateTime<FixedOffset> {
    // local = utc + offset
    offset.from_utc_datetime(&(*naive - offset))
}

fn parse_text(text: &str, default_offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
    if text.is_empty() {
        return Err(FramewiseError::Input("empty time value".to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt);
    }
    for format in AWARE_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Ok(dt);
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(attach(default_offset, &naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(attach(default_offset, &naive));
        }
    }
    if let Ok(secs) = text.parse::<i64>() {
        return TimeInput::Timestamp(secs).resolve(default_offset);
    }

    Err(FramewiseError::Input(format!("unrecognized time: {}", text)))
}

/// Offset for naive inputs, from a minute count.
pub fn offset_from_minutes(minutes: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(minutes.saturating_mul(60))
        .ok_or_else(|| FramewiseError::Config(format!("UTC offset out of range: {} minutes", minutes)))
}

/// Canonical stored form.
pub fn format_stored(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Parse a stored value; rows without an offset are read as UTC.
pub fn parse_stored(value: &str) -> Option<DateTime<FixedOffset>> {
    parse_text(value.trim(), Utc.fix()).ok()
}
