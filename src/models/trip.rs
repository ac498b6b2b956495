use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::warn;

use crate::dates::{format_date_for_display, parse_trip_date};
use crate::models::photo::PhotoView;
use crate::models::tag::{dedupe_tags, normalize_tag};
use crate::services::storage::UrlSigner;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// A point only when it is finite, in range and not the `0,0` placeholder.
    pub fn checked(lat: f64, lng: f64) -> Option<Self> {
        let in_range = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        if !in_range || (lat == 0.0 && lng == 0.0) {
            return None;
        }
        Some(Self { lat, lng })
    }

    pub fn display(&self, precision: usize) -> String {
        format!("{:.*}, {:.*}", precision, self.lat, precision, self.lng)
    }
}

/// Stored trip row as inserted by the trip service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trip {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub trip_date: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub trip_path: Option<String>,
    pub gpx_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the joined trip retrieval: photos and tags arrive as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct TripRow {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub trip_date: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub trip_path: Option<String>,
    pub gpx_file: Option<String>,
    pub photos: Option<String>,
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TripView {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub trip_date: Option<String>,
    pub display_date: String,
    pub location: Option<GeoPoint>,
    pub trip_path: Vec<[f64; 2]>,
    pub has_track: bool,
    pub photos: Vec<PhotoView>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TripView {
    pub fn from_row(row: TripRow, signer: &UrlSigner) -> Self {
        let location = match (row.lat, row.long) {
            (Some(lat), Some(lng)) => GeoPoint::checked(lat, lng),
            _ => None,
        };

        let trip_date = row
            .trip_date
            .as_deref()
            .and_then(parse_trip_date)
            .map(|date| date.format("%Y-%m-%d").to_string());
        let display_date = format_date_for_display(row.trip_date.as_deref());

        let trip_path = row
            .trip_path
            .as_deref()
            .map(|raw| parse_line_string(row.id, raw))
            .unwrap_or_default();

        let photos = parse_json_array(row.id, "photos", row.photos.as_deref())
            .iter()
            .filter_map(|value| PhotoView::from_json(value, signer))
            .collect();

        let tags = dedupe_tags(
            parse_json_array(row.id, "tags", row.tags.as_deref())
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_tag),
        );

        Self {
            id: row.id,
            title: row.title,
            description: row
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            trip_date,
            display_date,
            location,
            trip_path,
            has_track: row.gpx_file.is_some_and(|key| !key.trim().is_empty()),
            photos,
            tags,
            created_at: row.created_at,
        }
    }

    pub fn cover_photo(&self) -> Option<&PhotoView> {
        self.photos
            .iter()
            .find(|photo| photo.is_cover_photo)
            .or_else(|| self.photos.first())
    }

    /// Whether the trip can appear on the overview map at all.
    pub fn is_mappable(&self) -> bool {
        self.location.is_some() || !self.trip_path.is_empty()
    }
}

fn parse_json_array(trip_id: i64, column: &str, raw: Option<&str>) -> Vec<Value> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => Vec::new(),
        Ok(other) => {
            warn!(trip_id, "expected JSON array in {column}, got {other}");
            Vec::new()
        }
        Err(err) => {
            warn!(trip_id, "invalid JSON in {column}: {err}");
            Vec::new()
        }
    }
}

/// Reads `[lon, lat]` pairs from a GeoJSON LineString.
pub fn parse_line_string(trip_id: i64, raw: &str) -> Vec<[f64; 2]> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(trip_id, "invalid trip_path JSON: {err}");
            return Vec::new();
        }
    };
    if value.get("type").and_then(Value::as_str) != Some("LineString") {
        warn!(trip_id, "trip_path is not a LineString");
        return Vec::new();
    }
    let Some(coordinates) = value.get("coordinates").and_then(Value::as_array) else {
        warn!(trip_id, "trip_path has no coordinates");
        return Vec::new();
    };
    coordinates
        .iter()
        .filter_map(|pair| {
            let pair = pair.as_array()?;
            let lon = pair.first()?.as_f64()?;
            let lat = pair.get(1)?.as_f64()?;
            GeoPoint::checked(lat, lon).map(|_| [lon, lat])
        })
        .collect()
}

pub fn line_string_json(coordinates: &[[f64; 2]]) -> String {
    serde_json::json!({ "type": "LineString", "coordinates": coordinates }).to_string()
}
