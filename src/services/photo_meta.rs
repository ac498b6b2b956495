use std::io::Cursor;

use exif::{In, Reader, Tag, Value};
use tracing::debug;

use crate::models::trip::GeoPoint;

/// GPS position from a photo's EXIF block, if it carries one.
pub fn photo_location(bytes: &[u8]) -> Option<GeoPoint> {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(err) => {
            debug!("no readable EXIF data: {err}");
            return None;
        }
    };

    let lat = gps_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S')?;
    let lng = gps_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W')?;
    GeoPoint::checked(lat, lng)
}

fn gps_coordinate(exif: &exif::Exif, tag: Tag, reference: Tag, negative: u8) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    let degrees = parts.first()?.to_f64();
    let minutes = parts.get(1).map(|r| r.to_f64()).unwrap_or(0.0);
    let seconds = parts.get(2).map(|r| r.to_f64()).unwrap_or(0.0);
    let decimal = dms_to_decimal(degrees, minutes, seconds);

    let is_negative = exif
        .get_field(reference, In::PRIMARY)
        .and_then(|field| match &field.value {
            Value::Ascii(values) => values.first().and_then(|v| v.first().copied()),
            _ => None,
        })
        .map(|c| c.to_ascii_uppercase() == negative)
        .unwrap_or(false);

    Some(if is_negative { -decimal } else { decimal })
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}
