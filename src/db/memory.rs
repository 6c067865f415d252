use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{PhotoRepository, RepoError};
use crate::models::photo::{DuplicateStatus, NewPhoto, Photo, PhotoFilter};

/// Process-local photo repository, kept in upload order.
///
/// Writes can be made to fail on demand so the upload path's cleanup logic
/// can be exercised without a database.
#[derive(Default)]
pub struct MemoryPhotoRepository {
    state: Mutex<MemoryPhotos>,
}

#[derive(Default)]
struct MemoryPhotos {
    photos: Vec<Photo>,
    fail_creates: bool,
}

impl MemoryPhotoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    pub fn all(&self) -> Vec<Photo> {
        self.lock().photos.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryPhotos> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PhotoRepository for MemoryPhotoRepository {
    async fn create_photo(&self, photo: NewPhoto) -> Result<Photo, RepoError> {
        let mut state = self.lock();
        if state.fail_creates {
            return Err(RepoError::Database(sqlx::Error::PoolTimedOut));
        }

        let created = Photo {
            id: Uuid::new_v4(),
            url: photo.url,
            blob_id: photo.blob_id,
            thumbnail_url: photo.thumbnail_url,
            filename: photo.filename,
            size_bytes: photo.size_bytes,
            captured_at: photo.captured_at,
            location: photo.location,
            uploaded_at: Utc::now(),
            duplicate_status: DuplicateStatus::Unknown,
            check_deferred: false,
        };
        state.photos.push(created.clone());
        Ok(created)
    }

    async fn find_photos(
        &self,
        filter: &PhotoFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<Photo>, i64), RepoError> {
        let state = self.lock();
        let matching: Vec<&Photo> = state.photos.iter().filter(|p| filter.matches(p)).collect();

        let skip = usize::try_from((page.max(1) - 1).saturating_mul(limit)).unwrap_or(usize::MAX);
        let take = usize::try_from(limit.max(0)).unwrap_or(0);
        let data = matching.iter().skip(skip).take(take).map(|p| (*p).clone()).collect();

        Ok((data, matching.len() as i64))
    }

    async fn find_photo_by_id(&self, id: Uuid) -> Result<Option<Photo>, RepoError> {
        Ok(self.lock().photos.iter().find(|p| p.id == id).cloned())
    }

    async fn delete_photo(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut state = self.lock();
        let before = state.photos.len();
        state.photos.retain(|p| p.id != id);
        let deleted = state.photos.len() < before;

        if deleted {
            for photo in state.photos.iter_mut() {
                if photo.duplicate_status == DuplicateStatus::DuplicateOf(id) {
                    photo.duplicate_status = DuplicateStatus::Unknown;
                    photo.check_deferred = true;
                }
            }
        }
        Ok(deleted)
    }

    async fn update_duplicate_status(
        &self,
        id: Uuid,
        status: DuplicateStatus,
    ) -> Result<bool, RepoError> {
        let mut state = self.lock();
        match state.photos.iter_mut().find(|p| p.id == id) {
            Some(photo) => {
                photo.duplicate_status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_check_deferred(&self, id: Uuid, deferred: bool) -> Result<(), RepoError> {
        if let Some(photo) = self.lock().photos.iter_mut().find(|p| p.id == id) {
            photo.check_deferred = deferred;
        }
        Ok(())
    }

    async fn deferred_checks(&self, limit: i64) -> Result<Vec<Photo>, RepoError> {
        let take = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(self
            .lock()
            .photos
            .iter()
            .filter(|p| p.check_deferred)
            .take(take)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}
