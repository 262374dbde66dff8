//! Bidirectional mapping between host [`Value`]s and the engine's
//! storage classes.
//!
//! Binding ignores the column (the host value decides the storage
//! class); reading is driven by the column's declared kind so integers
//! come back as booleans, ticks, enums, or plain integers as declared.

use chrono::{DateTime, Duration as TimeSpan, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use uuid::Uuid;

use crate::error::StorageError;
use crate::mapping::{ColumnKind, ColumnMapping};
use crate::value::Value;

/// Ticks are 100 ns units counted from 0001-01-01T00:00:00.
pub(crate) const TICKS_PER_SECOND: i64 = 10_000_000;

/// Text form for date-times stored as text, invariant locale,
/// millisecond precision.
pub(crate) const DATE_TIME_TEXT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const DATE_TIME_PARSE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

fn tick_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .expect("0001-01-01 is a valid date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
}

pub(crate) fn date_time_to_ticks(value: &NaiveDateTime) -> i64 {
    let delta = value.signed_duration_since(tick_epoch());
    let seconds = delta.num_seconds();
    let subsecond = delta - TimeSpan::seconds(seconds);
    seconds * TICKS_PER_SECOND + subsecond.num_nanoseconds().unwrap_or(0) / 100
}

pub(crate) fn ticks_to_date_time(ticks: i64) -> Option<NaiveDateTime> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = ticks.rem_euclid(TICKS_PER_SECOND) * 100;
    tick_epoch()
        .checked_add_signed(TimeSpan::seconds(seconds))?
        .checked_add_signed(TimeSpan::nanoseconds(nanos))
}

pub(crate) fn time_span_to_ticks(value: &TimeSpan) -> Result<i64, StorageError> {
    let seconds = value.num_seconds();
    let subsecond = *value - TimeSpan::seconds(seconds);
    seconds
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|ticks| ticks.checked_add(subsecond.num_nanoseconds().unwrap_or(0) / 100))
        .ok_or_else(|| StorageError::UnsupportedBinding("time span out of range".to_owned()))
}

pub(crate) fn ticks_to_time_span(ticks: i64) -> Result<TimeSpan, StorageError> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = ticks.rem_euclid(TICKS_PER_SECOND) * 100;
    TimeSpan::try_seconds(seconds)
        .map(|span| span + TimeSpan::nanoseconds(nanos))
        .ok_or_else(|| StorageError::UnsupportedBinding("stored time span out of range".to_owned()))
}

fn parse_date_time_text(text: &str) -> Option<NaiveDateTime> {
    DATE_TIME_PARSE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// Convert a host value into the engine storage class it binds as.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedBinding`] for values outside the
/// representable range (overlong time spans).
pub(crate) fn bind_value(
    value: &Value,
    store_date_time_as_ticks: bool,
) -> Result<SqlValue, StorageError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(bytes) => SqlValue::Blob(bytes.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::DateTime(dt) => {
            if store_date_time_as_ticks {
                SqlValue::Integer(date_time_to_ticks(dt))
            } else {
                SqlValue::Text(dt.format(DATE_TIME_TEXT_FORMAT).to_string())
            }
        }
        Value::DateTimeOffset(dto) => SqlValue::Integer(date_time_to_ticks(&dto.naive_utc())),
        Value::TimeSpan(span) => SqlValue::Integer(time_span_to_ticks(span)?),
        Value::Uuid(uuid) => SqlValue::Text(uuid.to_string()),
    })
}

/// Read a raw column without a descriptor, keeping the storage class.
/// Used by scalar queries.
pub(crate) fn read_dynamic(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

fn integer_of(raw: ValueRef<'_>) -> Option<i64> {
    match raw {
        ValueRef::Integer(i) => Some(i),
        #[allow(clippy::cast_possible_truncation)]
        ValueRef::Real(r) => Some(r as i64),
        _ => None,
    }
}

fn real_of(raw: ValueRef<'_>) -> Option<f64> {
    match raw {
        ValueRef::Real(r) => Some(r),
        #[allow(clippy::cast_precision_loss)]
        ValueRef::Integer(i) => Some(i as f64),
        _ => None,
    }
}

fn text_of(raw: ValueRef<'_>) -> Option<String> {
    match raw {
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn read_mismatch(column: &ColumnMapping, raw: &ValueRef<'_>) -> StorageError {
    StorageError::UnsupportedBinding(format!(
        "column {:?} declared {:?} cannot hold stored {:?}",
        column.name,
        column.kind,
        raw.data_type()
    ))
}

/// Read a raw column into the host value the column's declared kind
/// calls for.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedBinding`] when the stored storage
/// class does not convert to the declared kind.
pub(crate) fn read_value(
    raw: ValueRef<'_>,
    column: &ColumnMapping,
) -> Result<Value, StorageError> {
    if matches!(raw, ValueRef::Null) {
        return Ok(Value::Null);
    }
    match column.kind {
        ColumnKind::Boolean => integer_of(raw)
            .map(|i| Value::Bool(i != 0))
            .ok_or_else(|| read_mismatch(column, &raw)),
        ColumnKind::Integer | ColumnKind::BigInteger => integer_of(raw)
            .map(Value::Integer)
            .ok_or_else(|| read_mismatch(column, &raw)),
        ColumnKind::Real => real_of(raw)
            .map(Value::Real)
            .ok_or_else(|| read_mismatch(column, &raw)),
        ColumnKind::Text => text_of(raw)
            .map(Value::Text)
            .ok_or_else(|| read_mismatch(column, &raw)),
        ColumnKind::Blob => match raw {
            ValueRef::Blob(bytes) => Ok(Value::Blob(bytes.to_vec())),
            _ => Err(read_mismatch(column, &raw)),
        },
        ColumnKind::DateTime => match raw {
            ValueRef::Integer(ticks) => ticks_to_date_time(ticks)
                .map(Value::DateTime)
                .ok_or_else(|| {
                    StorageError::UnsupportedBinding(format!(
                        "column {:?}: stored ticks {ticks} out of range",
                        column.name
                    ))
                }),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                parse_date_time_text(&text)
                    .map(Value::DateTime)
                    .ok_or_else(|| {
                        StorageError::UnsupportedBinding(format!(
                            "column {:?}: {text:?} is not a date-time",
                            column.name
                        ))
                    })
            }
            _ => Err(read_mismatch(column, &raw)),
        },
        ColumnKind::DateTimeOffset => {
            let ticks = integer_of(raw).ok_or_else(|| read_mismatch(column, &raw))?;
            // Out-of-range ticks resolve to the declared default
            // instead of failing the whole query.
            match ticks_to_date_time(ticks) {
                Some(naive) => {
                    let utc = Utc.from_utc_datetime(&naive);
                    Ok(Value::DateTimeOffset(DateTime::<FixedOffset>::from(utc)))
                }
                None => Ok(column.default_value.clone().unwrap_or(Value::Null)),
            }
        }
        ColumnKind::TimeSpan => {
            let ticks = integer_of(raw).ok_or_else(|| read_mismatch(column, &raw))?;
            ticks_to_time_span(ticks).map(Value::TimeSpan)
        }
        ColumnKind::Uuid => {
            let text = text_of(raw).ok_or_else(|| read_mismatch(column, &raw))?;
            Uuid::parse_str(&text).map(Value::Uuid).map_err(|_| {
                StorageError::UnsupportedBinding(format!(
                    "column {:?}: {text:?} is not a GUID",
                    column.name
                ))
            })
        }
        ColumnKind::Enum { store_as_text } => {
            if store_as_text {
                text_of(raw)
                    .map(Value::Text)
                    .ok_or_else(|| read_mismatch(column, &raw))
            } else {
                integer_of(raw)
                    .map(Value::Integer)
                    .ok_or_else(|| read_mismatch(column, &raw))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2012, 1, 14)
            .unwrap()
            .and_hms_milli_opt(3, 2, 1, 234)
            .unwrap()
    }

    #[test]
    fn ticks_round_trip_preserves_milliseconds() {
        let dt = sample();
        let ticks = date_time_to_ticks(&dt);
        assert_eq!(ticks_to_date_time(ticks), Some(dt));
    }

    #[test]
    fn text_form_matches_invariant_format() {
        let bound = bind_value(&Value::DateTime(sample()), false).unwrap();
        assert_eq!(bound, SqlValue::Text("2012-01-14T03:02:01.234".to_owned()));
    }

    #[test]
    fn text_form_parses_back() {
        assert_eq!(
            parse_date_time_text("2012-01-14T03:02:01.234"),
            Some(sample())
        );
        assert_eq!(
            parse_date_time_text("2012-01-14 03:02:01.234"),
            Some(sample())
        );
    }

    #[test]
    fn time_span_ticks_round_trip() {
        let span = TimeSpan::seconds(90) + TimeSpan::milliseconds(250);
        let ticks = time_span_to_ticks(&span).unwrap();
        assert_eq!(ticks, 902_500_000);
        assert_eq!(ticks_to_time_span(ticks).unwrap(), span);
    }

    #[test]
    fn bool_binds_as_integer() {
        assert_eq!(
            bind_value(&Value::Bool(true), true).unwrap(),
            SqlValue::Integer(1)
        );
        assert_eq!(
            bind_value(&Value::Bool(false), true).unwrap(),
            SqlValue::Integer(0)
        );
    }

    #[test]
    fn uuid_binds_as_36_char_text() {
        let uuid = Uuid::new_v4();
        match bind_value(&Value::Uuid(uuid), true).unwrap() {
            SqlValue::Text(text) => assert_eq!(text.len(), 36),
            other => panic!("expected text, got {other:?}"),
        }
    }
}
