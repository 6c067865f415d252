//! Perceptual fingerprints and the registry of photos already processed.

use async_trait::async_trait;
use image_hasher::{HashAlg, HasherConfig};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db::RepoError;

/// Side length of the hash grid; 8x8 gives a 64-bit hash.
const HASH_SIZE: u32 = 8;

/// Perceptual hash of an image's visual content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// DCT mean hash (pHash) of the decoded image.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        let hasher = HasherConfig::new()
            .hash_size(HASH_SIZE, HASH_SIZE)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();
        Ok(Self(hasher.hash_image(&img).as_bytes().to_vec()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hamming distance; fingerprints of different lengths never match.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        if self.0.len() != other.0.len() {
            return u32::MAX;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A fingerprint registered for a photo, with its registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFingerprint {
    pub seq: i64,
    pub photo_id: Uuid,
    pub fingerprint: Fingerprint,
}

/// A photo's place in the registry and everything registered before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub seq: i64,
    /// Fingerprints with a lower sequence, oldest first.
    pub earlier: Vec<StoredFingerprint>,
}

/// Registry of fingerprints of previously processed photos.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Register `fingerprint` for `photo_id` and return its sequence along
    /// with every fingerprint registered before it. Registering the same
    /// photo again keeps the first sequence.
    ///
    /// Registration and lookup are atomic with respect to other
    /// registrations: once a sequence is handed out, every lower sequence is
    /// already visible, so `earlier` is the same on every call.
    async fn register(
        &self,
        photo_id: Uuid,
        fingerprint: &Fingerprint,
    ) -> Result<Registration, RepoError>;
}

/// In-process fingerprint registry.
#[derive(Default)]
pub struct MemoryFingerprintStore {
    entries: Mutex<MemoryEntries>,
}

#[derive(Default)]
struct MemoryEntries {
    next_seq: i64,
    by_photo: HashMap<Uuid, StoredFingerprint>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().by_photo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryEntries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn register(
        &self,
        photo_id: Uuid,
        fingerprint: &Fingerprint,
    ) -> Result<Registration, RepoError> {
        let mut entries = self.lock();
        let seq = match entries.by_photo.get(&photo_id) {
            Some(existing) => existing.seq,
            None => {
                entries.next_seq += 1;
                let seq = entries.next_seq;
                entries.by_photo.insert(
                    photo_id,
                    StoredFingerprint {
                        seq,
                        photo_id,
                        fingerprint: fingerprint.clone(),
                    },
                );
                seq
            }
        };

        let mut earlier: Vec<StoredFingerprint> = entries
            .by_photo
            .values()
            .filter(|stored| stored.seq < seq)
            .cloned()
            .collect();
        earlier.sort_by_key(|stored| stored.seq);
        Ok(Registration { seq, earlier })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn png(pattern: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 64, |x, y| {
            let v = pattern(x, y);
            Rgb([v, v, v])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    /// 8x8 grid of pseudo-random gray cells; different seeds share no cells.
    fn noise_png(seed: u32) -> Vec<u8> {
        png(move |x, y| {
            let cell = x / 8 + (y / 8) * 8 + seed * 64;
            (cell.wrapping_mul(2_654_435_761) >> 24) as u8
        })
    }

    #[test]
    fn test_same_image_same_fingerprint() {
        let bytes = noise_png(1);
        let a = Fingerprint::from_image_bytes(&bytes).unwrap();
        let b = Fingerprint::from_image_bytes(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.distance(&b), 0);
        assert_eq!(a.as_bytes().len(), 8);
    }

    #[test]
    fn test_different_images_are_far_apart() {
        let first = Fingerprint::from_image_bytes(&noise_png(1)).unwrap();
        let second = Fingerprint::from_image_bytes(&noise_png(2)).unwrap();
        assert!(first.distance(&second) > 4);
    }

    #[test]
    fn test_undecodable_bytes_error() {
        assert!(Fingerprint::from_image_bytes(b"not an image").is_err());
    }

    #[test]
    fn test_distance_counts_bits() {
        let a = Fingerprint::from_bytes(vec![0b0000_0000, 0xFF]);
        let b = Fingerprint::from_bytes(vec![0b0000_0111, 0xFF]);
        assert_eq!(a.distance(&b), 3);
        assert_eq!(a.distance(&Fingerprint::from_bytes(vec![0])), u32::MAX);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = MemoryFingerprintStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let fp = Fingerprint::from_bytes(vec![1, 2, 3]);

        let first_a = store.register(a, &fp).await.unwrap();
        let first_b = store.register(b, &fp).await.unwrap();
        assert!(first_b.seq > first_a.seq);
        assert!(first_a.earlier.is_empty());
        assert_eq!(first_b.earlier.len(), 1);
        assert_eq!(first_b.earlier[0].photo_id, a);

        assert_eq!(store.register(a, &fp).await.unwrap(), first_a);
        assert_eq!(store.register(b, &fp).await.unwrap(), first_b);
        assert_eq!(store.len(), 2);
    }
}
