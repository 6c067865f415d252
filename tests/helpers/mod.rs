//! Shared in-memory collaborators for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgb};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use photo_dedup::app_state::AppState;
use photo_dedup::db::MemoryPhotoRepository;
use photo_dedup::models::job::{JobEnvelope, Verdict};
use photo_dedup::routes::{self, metrics::MetricsState};
use photo_dedup::services::detector::{DetectError, DuplicateDetector};
use photo_dedup::services::fetch::{FetchError, ImageFetcher};
use photo_dedup::services::queue::{MemoryQueue, DUPLICATE_CHECK_TOPIC};
use photo_dedup::services::storage::{BlobStore, StorageError, StoredImage};
use photo_dedup::services::upload::{UploadService, UploadedFile};

pub const BLOB_BASE_URL: &str = "https://blobs.test";

/// Blob store kept in memory. Individual upload calls can be made to fail.
#[derive(Default)]
pub struct FakeBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    failing_calls: Mutex<HashSet<usize>>,
    failing_deletes: Mutex<bool>,
}

impl FakeBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `call`-th upload (1-based) fail.
    pub fn fail_upload_call(&self, call: usize) {
        self.failing_calls.lock().unwrap().insert(call);
    }

    pub fn fail_deletes(&self, fail: bool) {
        *self.failing_deletes.lock().unwrap() = fail;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload_image(
        &self,
        data: &[u8],
        _content_type: &str,
    ) -> Result<StoredImage, StorageError> {
        let call = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_calls.lock().unwrap().contains(&call) {
            return Err(StorageError::Status(503));
        }

        let id = Uuid::new_v4().to_string();
        self.objects
            .lock()
            .unwrap()
            .insert(id.clone(), data.to_vec());
        Ok(StoredImage {
            url: format!("{BLOB_BASE_URL}/{id}"),
            id,
        })
    }

    fn thumbnail_url(&self, id: &str, width: u32) -> String {
        format!("{BLOB_BASE_URL}/thumb/{width}/{id}")
    }

    async fn delete_image(&self, id: &str) -> Result<(), StorageError> {
        if *self.failing_deletes.lock().unwrap() {
            return Err(StorageError::Status(500));
        }
        self.objects.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Serves stored blobs back by URL, standing in for the public bucket.
#[async_trait]
impl ImageFetcher for FakeBlobStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let id = url
            .strip_prefix(BLOB_BASE_URL)
            .map(|rest| rest.trim_start_matches('/'))
            .ok_or(FetchError::Status(404))?;
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

/// Detector that takes `delay` and always answers `Unique`.
pub struct SlowDetector {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowDetector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DuplicateDetector for SlowDetector {
    async fn check(&self, _envelope: &JobEnvelope) -> Result<Verdict, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Verdict::Unique)
    }
}

/// Detector that always fails, counting its calls.
#[derive(Default)]
pub struct FailingDetector {
    pub calls: AtomicUsize,
}

#[async_trait]
impl DuplicateDetector for FailingDetector {
    async fn check(&self, _envelope: &JobEnvelope) -> Result<Verdict, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DetectError::Fetch(FetchError::Status(503)))
    }
}

/// Everything the upload path needs, all in memory.
pub struct TestEnv {
    pub blobs: Arc<FakeBlobStore>,
    pub photos: Arc<MemoryPhotoRepository>,
    pub queue: Arc<MemoryQueue>,
    pub upload: UploadService,
}

impl TestEnv {
    pub fn new() -> Self {
        let blobs = Arc::new(FakeBlobStore::new());
        let photos = Arc::new(MemoryPhotoRepository::new());
        let queue = Arc::new(MemoryQueue::new(
            DUPLICATE_CHECK_TOPIC,
            Duration::from_secs(60),
        ));
        let upload = UploadService::new(blobs.clone(), photos.clone(), queue.clone(), 100, 300);
        Self {
            blobs,
            photos,
            queue,
            upload,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.photos.clone(),
            self.blobs.clone(),
            self.queue.clone(),
            100,
            300,
        )
    }

    /// Serve the full router on an ephemeral local port; returns its base URL.
    pub async fn spawn_server(&self) -> String {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let metrics_state = MetricsState {
            handle: Arc::new(handle),
            queue: self.queue.clone(),
        };
        let app = routes::router(self.app_state(), metrics_state, 20 * 1024 * 1024);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });
        format!("http://{addr}")
    }
}

/// 64x64 PNG made of an 8x8 grid of pseudo-random gray cells. Different
/// seeds give visually unrelated images.
pub fn noise_png(seed: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(64, 64, |x, y| {
        let cell = x / 8 + (y / 8) * 8 + seed * 64;
        let v = (cell.wrapping_mul(2_654_435_761) >> 24) as u8;
        Rgb([v, v, v])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

pub fn file(name: &str, bytes: Vec<u8>) -> UploadedFile {
    UploadedFile {
        filename: name.to_string(),
        bytes,
    }
}

/// Poll `condition` every 10ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
