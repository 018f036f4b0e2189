//! Conversion of heterogeneous time values into UTC epoch integers.
//!
//! Naive values are wall-clock times in the connection timezone. Aware values
//! carry their own offset and only need converting to UTC.

use crate::error::{EmoncmsError, Result};
use chrono::{
    DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use chrono_tz::Tz;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
const GAP_SEARCH_MINUTES: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Seconds,
    Millis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeValue {
    Naive(NaiveDateTime),
    Date(NaiveDate),
    Aware(DateTime<FixedOffset>),
    EpochSeconds(i64),
    Text(String),
}

impl From<NaiveDateTime> for TimeValue {
    fn from(value: NaiveDateTime) -> Self {
        TimeValue::Naive(value)
    }
}

impl From<NaiveDate> for TimeValue {
    fn from(value: NaiveDate) -> Self {
        TimeValue::Date(value)
    }
}

impl From<DateTime<FixedOffset>> for TimeValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        TimeValue::Aware(value)
    }
}

impl From<DateTime<Utc>> for TimeValue {
    fn from(value: DateTime<Utc>) -> Self {
        TimeValue::Aware(value.fixed_offset())
    }
}

impl From<DateTime<Tz>> for TimeValue {
    fn from(value: DateTime<Tz>) -> Self {
        TimeValue::Aware(value.fixed_offset())
    }
}

impl From<i64> for TimeValue {
    fn from(value: i64) -> Self {
        TimeValue::EpochSeconds(value)
    }
}

impl From<&str> for TimeValue {
    fn from(value: &str) -> Self {
        TimeValue::Text(value.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(value: String) -> Self {
        TimeValue::Text(value)
    }
}

impl TimeValue {
    /// Resolve to an absolute instant, reading naive values in `tz`.
    pub fn to_utc(&self, tz: &Tz) -> Result<DateTime<Utc>> {
        match self {
            TimeValue::Naive(naive) => localize(tz, *naive),
            TimeValue::Date(date) => {
                let midnight = date
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| EmoncmsError::InvalidTime(format!("invalid date {date}")))?;
                localize(tz, midnight)
            }
            TimeValue::Aware(aware) => Ok(aware.with_timezone(&Utc)),
            TimeValue::EpochSeconds(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| EmoncmsError::InvalidTime(format!("epoch {secs} out of range"))),
            TimeValue::Text(text) => parse_text(text)?.to_utc(tz),
        }
    }
}

/// Normalize `value` into an integer count of seconds or milliseconds since
/// the Unix epoch. Sub-unit precision is truncated.
pub fn normalize(value: &TimeValue, tz: &Tz, resolution: Resolution) -> Result<i64> {
    let utc = value.to_utc(tz)?;
    Ok(match resolution {
        Resolution::Seconds => utc.timestamp(),
        Resolution::Millis => utc.timestamp_millis(),
    })
}

pub fn from_epoch_seconds(secs: i64, tz: &Tz) -> Result<DateTime<Tz>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|utc| utc.with_timezone(tz))
        .ok_or_else(|| EmoncmsError::InvalidTime(format!("epoch {secs} out of range")))
}

pub fn from_epoch_millis(ms: i64, tz: &Tz) -> Result<DateTime<Tz>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|utc| utc.with_timezone(tz))
        .ok_or_else(|| EmoncmsError::InvalidTime(format!("epoch millis {ms} out of range")))
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EmoncmsError::Config(format!("unknown timezone \"{name}\"")))
}

fn parse_text(text: &str) -> Result<TimeValue> {
    let trimmed = text.trim();
    if let Ok(aware) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(TimeValue::Aware(aware));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(TimeValue::Naive(naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(TimeValue::Date(date));
    }
    Err(EmoncmsError::InvalidTime(format!(
        "unable to parse \"{trimmed}\" as a timestamp"
    )))
}

fn localize(tz: &Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(a, b) => {
            let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
            Ok(a.min(b))
        }
        LocalResult::None => find_next_valid_local(tz, naive, GAP_SEARCH_MINUTES)
            .map(|dt| {
                tracing::debug!(
                    local = %naive,
                    resolved = %dt.to_rfc3339(),
                    "nonexistent local time shifted to next valid minute"
                );
                dt.with_timezone(&Utc)
            })
            .ok_or_else(|| {
                EmoncmsError::InvalidTime(format!("no valid local time found after {naive}"))
            }),
    }
}

fn find_next_valid_local(tz: &Tz, naive: NaiveDateTime, max_minutes: i64) -> Option<DateTime<Tz>> {
    for minutes in 1..=max_minutes {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt),
            LocalResult::Ambiguous(a, b) => {
                return Some(if a.with_timezone(&Utc) <= b.with_timezone(&Utc) {
                    a
                } else {
                    b
                })
            }
            LocalResult::None => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .expect("date")
            .and_hms_opt(h, min, s)
            .expect("time")
    }

    #[test]
    fn naive_input_is_read_in_connection_timezone() {
        let tz = chrono_tz::Europe::Berlin;
        let value = TimeValue::from(naive(2024, 1, 15, 12, 0, 0));
        let secs = normalize(&value, &tz, Resolution::Seconds).expect("normalize");
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 15, 11, 0, 0)
            .single()
            .expect("utc");
        assert_eq!(secs, expected.timestamp());
    }

    #[test]
    fn aware_input_ignores_connection_timezone() {
        let aware = DateTime::parse_from_rfc3339("2024-06-01T08:30:00-04:00").expect("parse");
        let berlin = normalize(
            &aware.into(),
            &chrono_tz::Europe::Berlin,
            Resolution::Seconds,
        )
        .expect("berlin");
        let tokyo = normalize(&aware.into(), &chrono_tz::Asia::Tokyo, Resolution::Seconds)
            .expect("tokyo");
        assert_eq!(berlin, tokyo);
        assert_eq!(berlin, aware.timestamp());
    }

    #[test]
    fn millisecond_resolution_truncates() {
        let aware = DateTime::parse_from_rfc3339("2024-06-01T00:00:01.999+00:00").expect("parse");
        let value = TimeValue::from(aware);
        let tz = chrono_tz::UTC;
        assert_eq!(
            normalize(&value, &tz, Resolution::Millis).expect("ms"),
            aware.timestamp() * 1000 + 999
        );
        assert_eq!(
            normalize(&value, &tz, Resolution::Seconds).expect("s"),
            aware.timestamp()
        );
    }

    #[test]
    fn date_is_midnight_in_connection_timezone() {
        let tz = chrono_tz::America::New_York;
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).expect("date");
        let secs = normalize(&date.into(), &tz, Resolution::Seconds).expect("normalize");
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 2, 5, 0, 0)
            .single()
            .expect("utc");
        assert_eq!(secs, expected.timestamp());
    }

    #[test]
    fn text_inputs_parse_as_aware_or_naive() {
        let tz = chrono_tz::Europe::Berlin;
        let aware = normalize(&"2024-01-15T12:00:00Z".into(), &tz, Resolution::Seconds)
            .expect("aware");
        let naive = normalize(&"2024-01-15 13:00:00".into(), &tz, Resolution::Seconds)
            .expect("naive");
        assert_eq!(aware, naive);
        let date = normalize(&"2024-01-15".into(), &tz, Resolution::Seconds).expect("date");
        assert_eq!(aware - date, 13 * 3600);
    }

    #[test]
    fn garbage_text_is_an_invalid_time() {
        let err = normalize(&"yesterday-ish".into(), &chrono_tz::UTC, Resolution::Seconds)
            .unwrap_err();
        assert!(matches!(err, EmoncmsError::InvalidTime(_)));
    }

    #[test]
    fn dst_fold_resolves_to_earlier_instant() {
        let tz = chrono_tz::US::Eastern;
        let value = TimeValue::from(naive(2026, 11, 1, 1, 30, 0));
        let secs = normalize(&value, &tz, Resolution::Seconds).expect("normalize");
        let expected = Utc
            .with_ymd_and_hms(2026, 11, 1, 5, 30, 0)
            .single()
            .expect("utc");
        assert_eq!(secs, expected.timestamp());
    }

    #[test]
    fn dst_gap_resolves_to_next_valid_minute() {
        let tz = chrono_tz::US::Eastern;
        let value = TimeValue::from(naive(2026, 3, 8, 2, 30, 0));
        let secs = normalize(&value, &tz, Resolution::Seconds).expect("normalize");
        // 03:00 EDT is the first valid wall-clock minute after the gap.
        let expected = Utc
            .with_ymd_and_hms(2026, 3, 8, 7, 0, 0)
            .single()
            .expect("utc");
        assert_eq!(secs, expected.timestamp());
    }

    #[test]
    fn seconds_round_trip_through_every_zone() {
        let instant = Utc
            .with_ymd_and_hms(2025, 7, 4, 18, 45, 12)
            .single()
            .expect("utc");
        for tz in [
            chrono_tz::UTC,
            chrono_tz::Europe::Berlin,
            chrono_tz::America::Los_Angeles,
            chrono_tz::Asia::Kolkata,
            chrono_tz::Australia::Adelaide,
        ] {
            let local = instant.with_timezone(&tz);
            let secs = normalize(&local.into(), &tz, Resolution::Seconds).expect("normalize");
            let back = from_epoch_seconds(secs, &tz).expect("decode");
            assert_eq!(back, local);

            let wall = TimeValue::from(local.naive_local());
            assert_eq!(normalize(&wall, &tz, Resolution::Seconds).expect("naive"), secs);
        }
    }

    #[test]
    fn unknown_timezone_is_a_config_error() {
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(EmoncmsError::Config(_))
        ));
        assert_eq!(parse_timezone(" Europe/Berlin ").expect("tz"), chrono_tz::Europe::Berlin);
    }
}
