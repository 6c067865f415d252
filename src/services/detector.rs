//! Pluggable duplicate-check algorithm.
//!
//! Whatever the implementation, a detector must return the same verdict for
//! the same photo every time it runs, because the queue may deliver a job
//! more than once.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::RepoError;
use crate::models::job::{JobEnvelope, Verdict};
use crate::services::fetch::{FetchError, ImageFetcher};
use crate::services::fingerprint::{Fingerprint, FingerprintStore, StoredFingerprint};

#[async_trait]
pub trait DuplicateDetector: Send + Sync {
    async fn check(&self, envelope: &JobEnvelope) -> Result<Verdict, DetectError>;
}

/// Perceptual-hash detector.
///
/// Each photo is compared only with photos whose fingerprints were
/// registered before its own first registration, so later uploads can never
/// change an earlier verdict and a re-run sees exactly the same corpus.
pub struct PerceptualDetector {
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn FingerprintStore>,
    max_distance: u32,
}

impl PerceptualDetector {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn FingerprintStore>,
        max_distance: u32,
    ) -> Self {
        Self {
            fetcher,
            store,
            max_distance,
        }
    }

    pub async fn check_bytes(&self, photo_id: Uuid, bytes: Vec<u8>) -> Result<Verdict, DetectError> {
        let fingerprint =
            tokio::task::spawn_blocking(move || Fingerprint::from_image_bytes(&bytes)).await??;

        let registration = self.store.register(photo_id, &fingerprint).await?;

        Ok(closest_match(
            photo_id,
            &fingerprint,
            &registration.earlier,
            self.max_distance,
        ))
    }
}

#[async_trait]
impl DuplicateDetector for PerceptualDetector {
    async fn check(&self, envelope: &JobEnvelope) -> Result<Verdict, DetectError> {
        let bytes = self.fetcher.fetch(&envelope.url).await?;
        self.check_bytes(envelope.photo_id, bytes).await
    }
}

/// Nearest candidate within `max_distance`; ties go to the earliest registration.
pub fn closest_match(
    photo_id: Uuid,
    fingerprint: &Fingerprint,
    candidates: &[StoredFingerprint],
    max_distance: u32,
) -> Verdict {
    candidates
        .iter()
        .filter(|candidate| candidate.photo_id != photo_id)
        .map(|candidate| {
            (
                fingerprint.distance(&candidate.fingerprint),
                candidate.seq,
                candidate.photo_id,
            )
        })
        .filter(|(distance, _, _)| *distance <= max_distance)
        .min_by_key(|(distance, seq, _)| (*distance, *seq))
        .map_or(Verdict::Unique, |(_, _, original)| Verdict::DuplicateOf(original))
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Failed to fetch image: {0}")]
    Fetch(#[from] FetchError),

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Fingerprint store error: {0}")]
    Store(#[from] RepoError),

    #[error("Hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
