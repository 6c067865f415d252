use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::RepoError;
use crate::models::photo::{DuplicateStatus, GeoPoint, NewPhoto, Photo, PhotoFilter};

/// Durable store of photo records.
#[async_trait]
pub trait PhotoRepository: Send + Sync {
    async fn create_photo(&self, photo: NewPhoto) -> Result<Photo, RepoError>;

    /// One page of photos in upload order, plus the total matching count.
    async fn find_photos(
        &self,
        filter: &PhotoFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<Photo>, i64), RepoError>;

    async fn find_photo_by_id(&self, id: Uuid) -> Result<Option<Photo>, RepoError>;

    /// Returns `false` when no such photo existed. Photos marked as
    /// duplicates of the deleted one go back to `Unknown` and are flagged
    /// `check_deferred` so their check runs again.
    async fn delete_photo(&self, id: Uuid) -> Result<bool, RepoError>;

    /// Returns `false` when the photo no longer exists.
    async fn update_duplicate_status(
        &self,
        id: Uuid,
        status: DuplicateStatus,
    ) -> Result<bool, RepoError>;

    /// Flag or unflag a photo whose duplicate check still has to be enqueued.
    async fn set_check_deferred(&self, id: Uuid, deferred: bool) -> Result<(), RepoError>;

    /// Oldest photos whose duplicate check was deferred.
    async fn deferred_checks(&self, limit: i64) -> Result<Vec<Photo>, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}

const PHOTO_COLUMNS: &str = r#"
    id, url, blob_id, thumbnail_url, filename, size_bytes, captured_at,
    latitude, longitude, uploaded_at, duplicate_status, duplicate_of, check_deferred
"#;

/// PostgreSQL-backed photo repository.
#[derive(Clone)]
pub struct PgPhotoRepository {
    pool: PgPool,
}

impl PgPhotoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn photo_from_row(row: &PgRow) -> Result<Photo, RepoError> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let status: String = row.try_get("duplicate_status")?;

    Ok(Photo {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        blob_id: row.try_get("blob_id")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        filename: row.try_get("filename")?,
        size_bytes: row.try_get("size_bytes")?,
        captured_at: row.try_get("captured_at")?,
        location: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GeoPoint {
                latitude,
                longitude,
            }),
        uploaded_at: row.try_get("uploaded_at")?,
        duplicate_status: DuplicateStatus::from_columns(&status, row.try_get("duplicate_of")?),
        check_deferred: row.try_get("check_deferred")?,
    })
}

#[async_trait]
impl PhotoRepository for PgPhotoRepository {
    async fn create_photo(&self, photo: NewPhoto) -> Result<Photo, RepoError> {
        let sql = format!(
            r#"
            INSERT INTO photos (url, blob_id, thumbnail_url, filename, size_bytes,
                                captured_at, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {PHOTO_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&photo.url)
            .bind(&photo.blob_id)
            .bind(&photo.thumbnail_url)
            .bind(&photo.filename)
            .bind(photo.size_bytes)
            .bind(photo.captured_at)
            .bind(photo.location.map(|p| p.latitude))
            .bind(photo.location.map(|p| p.longitude))
            .fetch_one(&self.pool)
            .await?;

        photo_from_row(&row)
    }

    async fn find_photos(
        &self,
        filter: &PhotoFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<Photo>, i64), RepoError> {
        const WHERE: &str = r#"
            WHERE ($1::timestamptz IS NULL OR captured_at >= $1)
              AND ($2::timestamptz IS NULL OR captured_at <= $2)
              AND ($3::float8 IS NULL OR latitude BETWEEN $3 AND $4)
              AND ($5::float8 IS NULL OR longitude BETWEEN $5 AND $6)
        "#;

        let bbox = filter.within;
        let offset = (page.max(1) - 1).saturating_mul(limit);

        let list_sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM photos {WHERE} ORDER BY uploaded_at ASC, id ASC LIMIT $7 OFFSET $8"
        );
        let rows = sqlx::query(&list_sql)
            .bind(filter.captured_from)
            .bind(filter.captured_to)
            .bind(bbox.map(|b| b.min_latitude))
            .bind(bbox.map(|b| b.max_latitude))
            .bind(bbox.map(|b| b.min_longitude))
            .bind(bbox.map(|b| b.max_longitude))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) AS total FROM photos {WHERE}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(filter.captured_from)
            .bind(filter.captured_to)
            .bind(bbox.map(|b| b.min_latitude))
            .bind(bbox.map(|b| b.max_latitude))
            .bind(bbox.map(|b| b.min_longitude))
            .bind(bbox.map(|b| b.max_longitude))
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let photos = rows.iter().map(photo_from_row).collect::<Result<_, _>>()?;
        Ok((photos, total))
    }

    async fn find_photo_by_id(&self, id: Uuid) -> Result<Option<Photo>, RepoError> {
        let sql = format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(photo_from_row).transpose()
    }

    async fn delete_photo(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut tx = self.pool.begin().await?;

        // Must run before the delete: ON DELETE SET NULL clears duplicate_of.
        sqlx::query(
            r#"
            UPDATE photos
            SET duplicate_status = 'unknown',
                duplicate_of = NULL,
                check_deferred = TRUE
            WHERE duplicate_of = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM photos WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn update_duplicate_status(
        &self,
        id: Uuid,
        status: DuplicateStatus,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE photos
            SET duplicate_status = $1,
                duplicate_of = $2
            WHERE id = $3
            "#,
        )
        .bind(status.kind().as_ref())
        .bind(status.duplicate_of())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_check_deferred(&self, id: Uuid, deferred: bool) -> Result<(), RepoError> {
        sqlx::query("UPDATE photos SET check_deferred = $1 WHERE id = $2")
            .bind(deferred)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deferred_checks(&self, limit: i64) -> Result<Vec<Photo>, RepoError> {
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE check_deferred ORDER BY uploaded_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(photo_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
