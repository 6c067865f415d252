use axum::extract::multipart::MultipartError;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::RepoError;
use crate::models::photo::{Photo, PhotoPage, PhotoQuery};
use crate::services::storage::StorageError;
use crate::services::upload::{UploadError, UploadReport, UploadedFile};

/// Multipart field carrying the uploaded images.
const IMAGES_FIELD: &str = "images";

/// Error returned by the photo endpoints as `{ "error": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        tracing::error!(error = %e, "Photo repository error");
        ApiError::Internal
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "Blob storage error");
        ApiError::Upstream(format!("Blob storage failed: {e}"))
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(e.body_text())
        } else {
            ApiError::BadRequest(e.body_text())
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// POST /api/v1/upload: store a batch of images and queue a duplicate
/// check for each. Responds before any check has run.
pub async fn upload_photos(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReport>), ApiError> {
    let max_files = state.upload.max_files();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGES_FIELD) {
            continue;
        }
        if files.len() == max_files {
            return Err(UploadError::TooManyFiles(max_files).into());
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("image-{}", files.len()));
        let bytes = field.bytes().await?;
        files.push(UploadedFile {
            filename,
            bytes: bytes.to_vec(),
        });
    }

    tracing::info!(files = files.len(), "Received photo upload");
    let report = state.upload.upload_batch(files).await?;

    let status = if report.uploaded.is_empty() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(report)))
}

/// GET /api/v1/photos: paginated listing in upload order.
pub async fn list_photos(
    State(state): State<AppState>,
    query: Result<Query<PhotoQuery>, QueryRejection>,
) -> Result<Json<PhotoPage>, ApiError> {
    let Query(query) = query?;
    query
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;

    let filter = query.to_filter();
    let (data, total) = state
        .photos
        .find_photos(&filter, query.page, query.limit)
        .await?;

    Ok(Json(PhotoPage::new(query.page, query.limit, total, data)))
}

/// GET /api/v1/photos/{id}
pub async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Photo>, ApiError> {
    state
        .photos
        .find_photo_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Photo {id} not found")))
}

/// DELETE /api/v1/photos/{id}: removes the blob, then the record.
pub async fn delete_photo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let photo = state
        .photos
        .find_photo_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Photo {id} not found")))?;

    state.storage.delete_image(&photo.blob_id).await?;
    state.photos.delete_photo(id).await?;

    tracing::info!(photo_id = %id, blob_id = %photo.blob_id, "Photo deleted");
    Ok(StatusCode::NO_CONTENT)
}
