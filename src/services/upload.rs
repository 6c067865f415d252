//! Upload path: store each image, persist its record, then enqueue exactly
//! one duplicate-check job for it.
//!
//! Files are processed independently; a failure on one never rolls back or
//! blocks the others.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::db::{PhotoRepository, RepoError};
use crate::models::job::JobEnvelope;
use crate::models::photo::{NewPhoto, Photo};
use crate::services::exif;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::storage::{BlobStore, StorageError};

/// One file from a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    /// Position of the file in the request.
    pub index: usize,
    pub filename: String,
    pub code: &'static str,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: Vec<Photo>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No files uploaded")]
    NoFiles,

    #[error("Too many files: at most {0} per request")]
    TooManyFiles(usize),
}

/// Why a single file of a batch was not stored.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Unsupported or unrecognised image format")]
    UnsupportedFormat,

    #[error("Blob storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Saving the photo record failed: {0}")]
    Persistence(#[from] RepoError),
}

impl FileError {
    pub fn code(&self) -> &'static str {
        match self {
            FileError::UnsupportedFormat => "unsupported_format",
            FileError::Storage(_) => "storage",
            FileError::Persistence(_) => "persistence",
        }
    }
}

#[derive(Clone)]
pub struct UploadService {
    blobs: Arc<dyn BlobStore>,
    photos: Arc<dyn PhotoRepository>,
    queue: Arc<dyn JobQueue>,
    max_files: usize,
    thumbnail_width: u32,
}

impl UploadService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        photos: Arc<dyn PhotoRepository>,
        queue: Arc<dyn JobQueue>,
        max_files: usize,
        thumbnail_width: u32,
    ) -> Self {
        Self {
            blobs,
            photos,
            queue,
            max_files,
            thumbnail_width,
        }
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// Store a batch. Only batch-level validation fails the call; per-file
    /// problems end up in [`UploadReport::failed`].
    pub async fn upload_batch(&self, files: Vec<UploadedFile>) -> Result<UploadReport, UploadError> {
        if files.is_empty() {
            return Err(UploadError::NoFiles);
        }
        if files.len() > self.max_files {
            return Err(UploadError::TooManyFiles(self.max_files));
        }

        let mut report = UploadReport::default();
        for (index, file) in files.into_iter().enumerate() {
            let filename = file.filename.clone();
            match self.store_one(file).await {
                Ok(photo) => {
                    metrics::counter!("photos_uploaded_total").increment(1);
                    report.uploaded.push(photo);
                }
                Err(e) => {
                    tracing::warn!(index, filename = %filename, error = %e, "Photo upload failed");
                    metrics::counter!("photo_upload_failures_total", "reason" => e.code())
                        .increment(1);
                    report.failed.push(UploadFailure {
                        index,
                        filename,
                        code: e.code(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn store_one(&self, file: UploadedFile) -> Result<Photo, FileError> {
        let format =
            image::guess_format(&file.bytes).map_err(|_| FileError::UnsupportedFormat)?;
        let metadata = exif::parse(&file.bytes);

        let stored = self
            .blobs
            .upload_image(&file.bytes, format.to_mime_type())
            .await?;

        let new_photo = NewPhoto {
            thumbnail_url: self.blobs.thumbnail_url(&stored.id, self.thumbnail_width),
            url: stored.url,
            blob_id: stored.id.clone(),
            filename: file.filename,
            size_bytes: i64::try_from(file.bytes.len()).unwrap_or(i64::MAX),
            captured_at: metadata.captured_at.unwrap_or_else(Utc::now),
            location: metadata.location,
        };

        let photo = match self.photos.create_photo(new_photo).await {
            Ok(photo) => photo,
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete_image(&stored.id).await {
                    tracing::warn!(
                        blob_id = %stored.id,
                        error = %cleanup,
                        "Failed to remove blob of unsaved photo"
                    );
                }
                return Err(e.into());
            }
        };

        Ok(self.enqueue_check(photo).await)
    }

    /// Enqueue the duplicate check for a persisted photo. A queue outage
    /// leaves the photo flagged for the reconciliation sweep instead.
    async fn enqueue_check(&self, mut photo: Photo) -> Photo {
        let envelope = JobEnvelope::new(photo.id, photo.url.clone());
        match self.queue.enqueue(envelope).await {
            Ok(job_id) => {
                metrics::counter!("duplicate_check_jobs_enqueued_total").increment(1);
                tracing::info!(photo_id = %photo.id, job_id = %job_id, "Duplicate check enqueued");
            }
            Err(e) => {
                metrics::counter!("duplicate_check_enqueue_failures_total").increment(1);
                tracing::warn!(
                    photo_id = %photo.id,
                    topic = %self.queue.topic(),
                    error = %e,
                    "Duplicate check deferred, queue unavailable"
                );
                match self.photos.set_check_deferred(photo.id, true).await {
                    Ok(()) => photo.check_deferred = true,
                    Err(db) => tracing::error!(
                        photo_id = %photo.id,
                        error = %db,
                        "Failed to flag deferred duplicate check"
                    ),
                }
            }
        }
        photo
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueue checks for photos whose job could not be enqueued at upload time.
/// Returns how many were enqueued.
pub async fn reconcile_deferred_checks(
    photos: &dyn PhotoRepository,
    queue: &dyn JobQueue,
    batch: i64,
) -> Result<usize, ReconcileError> {
    let deferred = photos.deferred_checks(batch).await?;
    let mut enqueued = 0;

    for photo in deferred {
        let job_id = queue
            .enqueue(JobEnvelope::new(photo.id, photo.url.clone()))
            .await?;
        photos.set_check_deferred(photo.id, false).await?;
        metrics::counter!("duplicate_check_jobs_enqueued_total").increment(1);
        tracing::info!(photo_id = %photo.id, job_id = %job_id, "Deferred duplicate check enqueued");
        enqueued += 1;
    }

    Ok(enqueued)
}
