use std::sync::Arc;

use crate::db::PhotoRepository;
use crate::services::{queue::JobQueue, storage::BlobStore, upload::UploadService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub photos: Arc<dyn PhotoRepository>,
    pub storage: Arc<dyn BlobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub upload: UploadService,
}

impl AppState {
    pub fn new(
        photos: Arc<dyn PhotoRepository>,
        storage: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        max_upload_files: usize,
        thumbnail_width: u32,
    ) -> Self {
        let upload = UploadService::new(
            storage.clone(),
            photos.clone(),
            queue.clone(),
            max_upload_files,
            thumbnail_width,
        );
        Self {
            photos,
            storage,
            queue,
            upload,
        }
    }
}
