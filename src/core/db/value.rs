/// Value Module
///
/// Tagged values exchanged with the driver. Parameters and column extraction
/// dispatch on [`ValueKind`] with one binder/extractor per tag.
///
/// Also holds the conversions between the native calendar structures and
/// `chrono` types, plus the scalar epoch representations (days since epoch
/// for dates, microseconds since epoch for timestamps).

use crate::driver::{SqlDate, SqlTime, SqlTimestamp};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;
use thiserror::Error;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Logical kind of a parameter or column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    DateTime,
    Time,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Date => "date",
            ValueKind::DateTime => "datetime",
            ValueKind::Time => "time",
        };
        f.write_str(name)
    }
}

/// A typed, non-NULL value. NULL is carried separately as a flag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Date(_) => ValueKind::Date,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Time(_) => ValueKind::Time,
        }
    }

    /// Placeholder value of `kind`, used as the buffer content of NULL parameters.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Date => Value::Date(NaiveDate::default()),
            ValueKind::DateTime => Value::DateTime(NaiveDateTime::default()),
            ValueKind::Time => Value::Time(NaiveTime::default()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.6f")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

/// One ordinal parameter: a value plus an explicit NULL flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Value,
    pub is_null: bool,
}

impl Parameter {
    pub fn new(value: impl Into<Value>) -> Self {
        Parameter {
            value: value.into(),
            is_null: false,
        }
    }

    /// A NULL parameter bound with the native type of `kind`.
    pub fn null(kind: ValueKind) -> Self {
        Parameter {
            value: Value::zero(kind),
            is_null: true,
        }
    }
}

/// Calendar fields that do not form a valid date or time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid calendar value: {0}")]
pub struct InvalidCalendarValue(pub String);

/// The native year field is 16 bits wide.
fn native_year(year: i32) -> Result<i16, InvalidCalendarValue> {
    i16::try_from(year).map_err(|_| InvalidCalendarValue(format!("year {} out of range", year)))
}

impl TryFrom<NaiveDate> for SqlDate {
    type Error = InvalidCalendarValue;

    fn try_from(date: NaiveDate) -> Result<Self, Self::Error> {
        Ok(SqlDate {
            year: native_year(date.year())?,
            month: date.month() as u16,
            day: date.day() as u16,
        })
    }
}

impl TryFrom<SqlDate> for NaiveDate {
    type Error = InvalidCalendarValue;

    fn try_from(date: SqlDate) -> Result<Self, Self::Error> {
        NaiveDate::from_ymd_opt(i32::from(date.year), u32::from(date.month), u32::from(date.day))
            .ok_or_else(|| InvalidCalendarValue(format!("{:?}", date)))
    }
}

impl From<NaiveTime> for SqlTime {
    fn from(time: NaiveTime) -> Self {
        SqlTime {
            hour: time.hour() as u16,
            minute: time.minute() as u16,
            second: time.second() as u16,
        }
    }
}

impl TryFrom<SqlTime> for NaiveTime {
    type Error = InvalidCalendarValue;

    fn try_from(time: SqlTime) -> Result<Self, Self::Error> {
        NaiveTime::from_hms_opt(u32::from(time.hour), u32::from(time.minute), u32::from(time.second))
            .ok_or_else(|| InvalidCalendarValue(format!("{:?}", time)))
    }
}

impl TryFrom<NaiveDateTime> for SqlTimestamp {
    type Error = InvalidCalendarValue;

    fn try_from(ts: NaiveDateTime) -> Result<Self, Self::Error> {
        Ok(SqlTimestamp {
            year: native_year(ts.year())?,
            month: ts.month() as u16,
            day: ts.day() as u16,
            hour: ts.hour() as u16,
            minute: ts.minute() as u16,
            second: ts.second() as u16,
            // Leap-second nanoseconds (>= 1s) are not representable natively
            fraction: ts.nanosecond().min(999_999_999),
        })
    }
}

impl TryFrom<SqlTimestamp> for NaiveDateTime {
    type Error = InvalidCalendarValue;

    fn try_from(ts: SqlTimestamp) -> Result<Self, Self::Error> {
        NaiveDate::from_ymd_opt(i32::from(ts.year), u32::from(ts.month), u32::from(ts.day))
            .and_then(|d| {
                d.and_hms_nano_opt(
                    u32::from(ts.hour),
                    u32::from(ts.minute),
                    u32::from(ts.second),
                    ts.fraction,
                )
            })
            .ok_or_else(|| InvalidCalendarValue(format!("{:?}", ts)))
    }
}

/// Drops sub-microsecond precision.
pub fn truncate_to_micros(ts: NaiveDateTime) -> NaiveDateTime {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}

pub fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn date_from_days_since_epoch(days: i32) -> Option<NaiveDate> {
    days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

/// Date, time-of-day and sub-second fraction composed into one scalar.
pub fn micros_since_epoch(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

pub fn date_time_from_micros_since_epoch(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

/// Parses `YYYY-MM-DD`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// Parses `HH:MM:SS` with an optional fraction.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f").ok()
}

/// Parses `YYYY-MM-DD HH:MM:SS[.fraction]` (or the `T`-separated form);
/// a bare date is taken as midnight.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_days_since_epoch() {
        assert_eq!(days_since_epoch(ymd(1970, 1, 1)), 0);
        assert_eq!(days_since_epoch(ymd(1970, 1, 2)), 1);
        assert_eq!(days_since_epoch(ymd(1969, 12, 31)), -1);
        assert_eq!(days_since_epoch(ymd(2000, 3, 1)), 11_017);
        assert_eq!(date_from_days_since_epoch(11_017), Some(ymd(2000, 3, 1)));
    }

    #[test]
    fn test_micros_since_epoch_composes_fraction() {
        let ts = ymd(1970, 1, 2).and_hms_micro_opt(0, 0, 1, 250).unwrap();
        assert_eq!(micros_since_epoch(ts), 86_400_000_000 + 1_000_000 + 250);
        assert_eq!(date_time_from_micros_since_epoch(micros_since_epoch(ts)), Some(ts));
    }

    #[test]
    fn test_timestamp_struct_carries_nanoseconds() {
        let ts = ymd(2024, 2, 29).and_hms_nano_opt(13, 14, 15, 123_456_789).unwrap();
        let native = SqlTimestamp::try_from(ts).unwrap();
        assert_eq!(native.fraction, 123_456_789);
        assert_eq!((native.year, native.month, native.day), (2024, 2, 29));
        assert_eq!(NaiveDateTime::try_from(native), Ok(ts));
        assert_eq!(
            truncate_to_micros(ts),
            ymd(2024, 2, 29).and_hms_micro_opt(13, 14, 15, 123_456).unwrap()
        );
    }

    #[test]
    fn test_invalid_calendar_fields() {
        let bad = SqlDate { year: 2023, month: 2, day: 30 };
        assert!(NaiveDate::try_from(bad).is_err());
        let bad = SqlTime { hour: 24, minute: 0, second: 0 };
        assert!(NaiveTime::try_from(bad).is_err());
    }

    #[test]
    fn test_years_beyond_native_range_are_rejected() {
        let far = ymd(40_000, 1, 1);
        assert_eq!(
            SqlDate::try_from(far),
            Err(InvalidCalendarValue("year 40000 out of range".to_string()))
        );
        assert!(SqlTimestamp::try_from(far.and_hms_opt(0, 0, 0).unwrap()).is_err());
        assert!(SqlDate::try_from(ymd(-32_768, 1, 1)).is_ok());
    }

    #[test]
    fn test_parse_text_forms() {
        assert_eq!(parse_date("2021-07-04"), Some(ymd(2021, 7, 4)));
        assert_eq!(parse_time("08:30:00"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(
            parse_timestamp("2021-07-04 08:30:00.5"),
            ymd(2021, 7, 4).and_hms_milli_opt(8, 30, 0, 500)
        );
        assert_eq!(parse_timestamp("2021-07-04"), ymd(2021, 7, 4).and_hms_opt(0, 0, 0));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_null_parameter_keeps_kind() {
        let p = Parameter::null(ValueKind::Date);
        assert!(p.is_null);
        assert_eq!(p.value.kind(), ValueKind::Date);
        assert_eq!(Parameter::new("x").value, Value::Text("x".to_string()));
    }
}
