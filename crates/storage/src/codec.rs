//! Tagged timestamp encoding for stored values.
//!
//! JSON has no timestamp type, so datetimes travel through backends as
//! `"datetime::<unix>"` and dates as `"date::<unix>"` strings. Plain strings
//! round-trip untouched; only values produced by [`tag_datetime`] and
//! [`tag_date`] decode back into chrono types.

use chrono::{DateTime, NaiveDate, Utc};
use courier_core::{Error, Result};
use serde_json::Value;

const DATETIME_TAG: &str = "datetime::";
const DATE_TAG: &str = "date::";

pub fn tag_datetime(dt: &DateTime<Utc>) -> Value {
    Value::String(format!("{}{}", DATETIME_TAG, dt.timestamp()))
}

pub fn tag_date(date: &NaiveDate) -> Value {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .map(|dt| dt.timestamp())
        .unwrap_or_default();
    Value::String(format!("{}{}", DATE_TAG, midnight))
}

pub fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.strip_prefix(DATETIME_TAG)?;
    let secs: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}

pub fn as_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?.strip_prefix(DATE_TAG)?;
    let secs: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}

/// Stable text form used by backends that persist values as strings.
pub fn to_text(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(Error::from)
}

pub fn from_text(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_tag_round_trip() {
        let dt = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let tagged = tag_datetime(&dt);
        assert_eq!(tagged, serde_json::json!("datetime::1700000000"));
        assert_eq!(as_datetime(&tagged), Some(dt));
    }

    #[test]
    fn date_tag_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let tagged = tag_date(&date);
        assert_eq!(as_date(&tagged), Some(date));
    }

    #[test]
    fn plain_strings_do_not_decode() {
        assert!(as_datetime(&serde_json::json!("hello")).is_none());
        assert!(as_date(&serde_json::json!("datetime::notanumber")).is_none());
    }

    #[test]
    fn text_form_is_byte_stable() {
        let dt = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let value = serde_json::json!({
            "seen": {"when": tag_datetime(&dt), "count": 3},
            "tags": ["a", "b"],
        });
        let text = to_text(&value).unwrap();
        let back = from_text(&text).unwrap();
        assert_eq!(back, value);
        assert_eq!(to_text(&back).unwrap(), text);
        assert_eq!(as_datetime(&back["seen"]["when"]), Some(dt));
    }
}
