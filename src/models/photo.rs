use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::job::Verdict;

/// Kilometres per degree of latitude, used for the bounding-box radius search.
const KM_PER_DEGREE: f64 = 111.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Duplicate-check result stored on a photo. Only the worker moves it away
/// from `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "photoId", rename_all = "snake_case")]
pub enum DuplicateStatus {
    #[default]
    Unknown,
    Unique,
    DuplicateOf(Uuid),
}

/// Column representation of [`DuplicateStatus`]; the target id lives in `duplicate_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DuplicateStatusKind {
    Unknown,
    Unique,
    Duplicate,
}

impl DuplicateStatus {
    pub fn kind(&self) -> DuplicateStatusKind {
        match self {
            DuplicateStatus::Unknown => DuplicateStatusKind::Unknown,
            DuplicateStatus::Unique => DuplicateStatusKind::Unique,
            DuplicateStatus::DuplicateOf(_) => DuplicateStatusKind::Duplicate,
        }
    }

    pub fn duplicate_of(&self) -> Option<Uuid> {
        match self {
            DuplicateStatus::DuplicateOf(id) => Some(*id),
            _ => None,
        }
    }

    /// Rebuild from the stored columns. A duplicate row without a target
    /// reads as `Unknown`.
    pub fn from_columns(kind: &str, duplicate_of: Option<Uuid>) -> Self {
        match (kind.parse::<DuplicateStatusKind>(), duplicate_of) {
            (Ok(DuplicateStatusKind::Unique), _) => DuplicateStatus::Unique,
            (Ok(DuplicateStatusKind::Duplicate), Some(id)) => DuplicateStatus::DuplicateOf(id),
            _ => DuplicateStatus::Unknown,
        }
    }
}

impl From<Verdict> for DuplicateStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Unique => DuplicateStatus::Unique,
            Verdict::DuplicateOf(id) => DuplicateStatus::DuplicateOf(id),
        }
    }
}

/// A stored photo record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: Uuid,
    pub url: String,
    /// Blob-store identifier, needed to delete the binary.
    pub blob_id: String,
    pub thumbnail_url: String,
    pub filename: String,
    pub size_bytes: i64,
    pub captured_at: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub uploaded_at: DateTime<Utc>,
    pub duplicate_status: DuplicateStatus,
    /// Set when the duplicate-check job could not be enqueued at upload time.
    pub check_deferred: bool,
}

/// Fields supplied by the upload path when creating a record.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub url: String,
    pub blob_id: String,
    pub thumbnail_url: String,
    pub filename: String,
    pub size_bytes: i64,
    pub captured_at: DateTime<Utc>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Square box of `radius_km` around `center`.
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        let delta = radius_km / KM_PER_DEGREE;
        Self {
            min_latitude: center.latitude - delta,
            max_latitude: center.latitude + delta,
            min_longitude: center.longitude - delta,
            max_longitude: center.longitude + delta,
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }
}

/// Filter applied when listing photos.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFilter {
    pub captured_from: Option<DateTime<Utc>>,
    pub captured_to: Option<DateTime<Utc>>,
    pub within: Option<BoundingBox>,
}

impl PhotoFilter {
    pub fn matches(&self, photo: &Photo) -> bool {
        if self.captured_from.is_some_and(|from| photo.captured_at < from) {
            return false;
        }
        if self.captured_to.is_some_and(|to| photo.captured_at > to) {
            return false;
        }
        match (self.within, photo.location) {
            (Some(bbox), Some(point)) => bbox.contains(point),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Query string of `GET /api/v1/photos`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PhotoQuery {
    #[serde(default = "default_page")]
    #[garde(range(min = 1))]
    pub page: i64,

    #[serde(default = "default_limit")]
    #[garde(range(min = 1, max = 100))]
    pub limit: i64,

    #[garde(custom(valid_date))]
    pub start_date: Option<String>,

    #[garde(custom(valid_date))]
    pub end_date: Option<String>,

    #[garde(range(min = -90.0, max = 90.0))]
    pub lat: Option<f64>,

    #[garde(range(min = -180.0, max = 180.0))]
    pub lng: Option<f64>,

    #[garde(custom(positive_radius))]
    pub radius: Option<f64>,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    10
}

fn valid_date(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value.as_deref() {
        Some(raw) if parse_date_param(raw).is_none() => {
            Err(garde::Error::new("expected an RFC 3339 timestamp or YYYY-MM-DD date"))
        }
        _ => Ok(()),
    }
}

fn positive_radius(value: &Option<f64>, _ctx: &()) -> garde::Result {
    match value {
        Some(radius) if !(*radius > 0.0) => Err(garde::Error::new("radius must be positive")),
        _ => Ok(()),
    }
}

/// Accepts RFC 3339 timestamps or plain dates (midnight UTC).
pub fn parse_date_param(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl PhotoQuery {
    /// Build the repository filter. The location filter only applies when
    /// `lat`, `lng` and `radius` are all present.
    pub fn to_filter(&self) -> PhotoFilter {
        let within = match (self.lat, self.lng, self.radius) {
            (Some(latitude), Some(longitude), Some(radius)) => Some(BoundingBox::around(
                GeoPoint {
                    latitude,
                    longitude,
                },
                radius,
            )),
            _ => None,
        };

        PhotoFilter {
            captured_from: self.start_date.as_deref().and_then(parse_date_param),
            captured_to: self.end_date.as_deref().and_then(parse_date_param),
            within,
        }
    }
}

/// Paginated response of `GET /api/v1/photos`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoPage {
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
    pub total_photos: i64,
    pub data: Vec<Photo>,
}

impl PhotoPage {
    pub fn new(page: i64, limit: i64, total_photos: i64, data: Vec<Photo>) -> Self {
        let total_pages = if limit > 0 {
            (total_photos + limit - 1) / limit
        } else {
            0
        };
        Self {
            page,
            limit,
            total_pages,
            total_photos,
            data,
        }
    }
}
