use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::warn;

use crate::models::trip::GeoPoint;
use crate::services::storage::{UrlSigner, PHOTO_BUCKET};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Photo {
    pub id: i64,
    pub trip_id: i64,
    pub user_id: Option<i64>,
    pub url: String,
    pub name: Option<String>,
    pub is_cover_photo: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PhotoView {
    pub id: Option<i64>,
    pub url: String,
    pub name: Option<String>,
    pub is_cover_photo: bool,
    pub location: Option<GeoPoint>,
}

impl PhotoView {
    /// Builds a view from one element of the aggregated `photos` JSON array.
    /// Returns `None` for entries without a usable URL.
    pub fn from_json(value: &Value, signer: &UrlSigner) -> Option<Self> {
        let obj = value.as_object()?;
        let raw_url = obj
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())?;

        let url = if is_external_url(raw_url) {
            raw_url.to_string()
        } else {
            match signer.signed_url(PHOTO_BUCKET, raw_url) {
                Ok(url) => url,
                Err(err) => {
                    warn!("dropping photo with unusable storage key {raw_url:?}: {err}");
                    return None;
                }
            }
        };

        let location = match (
            obj.get("lat").and_then(Value::as_f64),
            obj.get("long").and_then(Value::as_f64),
        ) {
            (Some(lat), Some(lng)) => GeoPoint::checked(lat, lng),
            _ => None,
        };

        Some(Self {
            id: obj.get("id").and_then(json_id),
            url,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_cover_photo: obj.get("is_cover_photo").map(json_bool).unwrap_or(false),
            location,
        })
    }
}

fn is_external_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn json_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "t"),
        _ => false,
    }
}
