use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use std::io::Cursor;

use crate::models::photo::GeoPoint;

/// Capture metadata embedded in an image. Both fields are optional: missing
/// EXIF data is a normal outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureMetadata {
    pub captured_at: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
}

/// Extract capture time and GPS position from raw image bytes.
pub fn parse(bytes: &[u8]) -> CaptureMetadata {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(e) => {
            tracing::debug!(error = %e, "No readable EXIF data");
            return CaptureMetadata::default();
        }
    };

    let captured_at = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY))
        .and_then(|field| ascii_value(&field.value))
        .and_then(|raw| parse_exif_datetime(&raw));

    let location = match (
        exif.get_field(Tag::GPSLatitude, In::PRIMARY),
        exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY),
        exif.get_field(Tag::GPSLongitude, In::PRIMARY),
        exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY),
    ) {
        (Some(lat), Some(lat_ref), Some(lon), Some(lon_ref)) => {
            let latitude = dms_to_decimal(&lat.value);
            let longitude = dms_to_decimal(&lon.value);
            match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => {
                    let south = ascii_value(&lat_ref.value).is_some_and(|r| r.starts_with('S'));
                    let west = ascii_value(&lon_ref.value).is_some_and(|r| r.starts_with('W'));
                    Some(GeoPoint {
                        latitude: if south { -latitude } else { latitude },
                        longitude: if west { -longitude } else { longitude },
                    })
                }
                _ => None,
            }
        }
        _ => None,
    };

    CaptureMetadata {
        captured_at,
        location,
    }
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string()),
        _ => None,
    }
}

/// EXIF timestamps carry no zone; they are read as UTC.
fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Degrees/minutes/seconds rationals to decimal degrees.
fn dms_to_decimal(value: &Value) -> Option<f64> {
    let Value::Rational(parts) = value else {
        return None;
    };
    if parts.len() < 3 || parts.iter().take(3).any(|r| r.denom == 0) {
        return None;
    }
    let degrees = parts[0].to_f64();
    let minutes = parts[1].to_f64();
    let seconds = parts[2].to_f64();
    Some(degrees + minutes / 60.0 + seconds / 3600.0)
}
