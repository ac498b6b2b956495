//! Lenient trip date handling. Dates arrive as `YYYY-MM-DD` from forms and
//! as full ISO timestamps from older rows; both collapse to a calendar day.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::warn;

const API_FORMAT: &str = "%Y-%m-%d";

pub fn parse_trip_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.date());
        }
    }
    NaiveDate::parse_from_str(raw, API_FORMAT).ok()
}

pub fn format_date_for_display(raw: Option<&str>) -> String {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return "No date".into();
    };
    match parse_trip_date(raw) {
        Some(date) => date.format("%B %-d, %Y").to_string(),
        None => {
            warn!("invalid trip date: {raw:?}");
            "Invalid date".into()
        }
    }
}

pub fn format_date_for_input(raw: Option<&str>, today: NaiveDate) -> String {
    normalize_or(raw, today)
}

pub fn format_date_for_api(raw: Option<&str>, today: NaiveDate) -> String {
    normalize_or(raw, today)
}

fn normalize_or(raw: Option<&str>, today: NaiveDate) -> String {
    let date = match raw.filter(|value| !value.trim().is_empty()) {
        Some(value) => parse_trip_date(value).unwrap_or_else(|| {
            warn!("invalid trip date {value:?}, falling back to today");
            today
        }),
        None => today,
    };
    date.format(API_FORMAT).to_string()
}
