use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

/// Location of an image stored by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// Store-specific identifier, needed for deletion.
    pub id: String,
    /// Canonical public URL of the image.
    pub url: String,
}

/// Binary object storage for uploaded images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_image(&self, data: &[u8], content_type: &str)
        -> Result<StoredImage, StorageError>;

    fn thumbnail_url(&self, id: &str, width: u32) -> String;

    async fn delete_image(&self, id: &str) -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (AWS S3, Cloudflare R2, MinIO).
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    public_url: String,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Object key for a new upload, with an extension derived from the content type.
fn object_key(content_type: &str) -> String {
    let extension = match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    };
    format!("photos/{}.{}", Uuid::new_v4(), extension)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload_image(
        &self,
        data: &[u8],
        content_type: &str,
    ) -> Result<StoredImage, StorageError> {
        let key = object_key(content_type);
        let response = self
            .bucket
            .put_object_with_content_type(&key, data, content_type)
            .await?;

        if !(200..300).contains(&response.status_code()) {
            return Err(StorageError::Status(response.status_code()));
        }

        Ok(StoredImage {
            url: format!("{}/{}", self.public_url, key),
            id: key,
        })
    }

    /// Resized variant served through the CDN's `/cdn-cgi/image` transform path.
    fn thumbnail_url(&self, id: &str, width: u32) -> String {
        format!("{}/cdn-cgi/image/width={}/{}", self.public_url, width, id)
    }

    async fn delete_image(&self, id: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(id).await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(StorageError::Status(response.status_code()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 responded with status {0}")]
    Status(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
