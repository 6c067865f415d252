use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::RepoError;
use crate::services::fingerprint::{
    Fingerprint, FingerprintStore, Registration, StoredFingerprint,
};

/// Advisory lock key serializing fingerprint registrations.
const REGISTRATION_LOCK: i64 = 0x7068_6f74_6f5f_6670;

/// PostgreSQL-backed fingerprint registry (`photo_fingerprints`).
///
/// A sequence value is handed out before the inserting transaction commits,
/// so two concurrent registrations could otherwise commit out of order. Each
/// registration holds a transaction-scoped advisory lock from insert to
/// lookup, which makes commit order match sequence order.
#[derive(Clone)]
pub struct PgFingerprintStore {
    pool: PgPool,
}

impl PgFingerprintStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintStore for PgFingerprintStore {
    // TODO: replace the linear scan with a multi-index hash lookup (split the
    // 64-bit hash into bands) once the corpus outgrows a full fetch per check.
    async fn register(
        &self,
        photo_id: Uuid,
        fingerprint: &Fingerprint,
    ) -> Result<Registration, RepoError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(REGISTRATION_LOCK)
            .execute(&mut *tx)
            .await?;

        // The no-op update makes RETURNING yield the existing row on conflict.
        let seq: i64 = sqlx::query(
            r#"
            INSERT INTO photo_fingerprints (photo_id, hash)
            VALUES ($1, $2)
            ON CONFLICT (photo_id) DO UPDATE SET photo_id = EXCLUDED.photo_id
            RETURNING seq
            "#,
        )
        .bind(photo_id)
        .bind(fingerprint.as_bytes())
        .fetch_one(&mut *tx)
        .await?
        .try_get("seq")?;

        let rows = sqlx::query(
            r#"
            SELECT seq, photo_id, hash
            FROM photo_fingerprints
            WHERE seq < $1
            ORDER BY seq ASC
            "#,
        )
        .bind(seq)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let earlier = rows
            .into_iter()
            .map(|r| -> Result<StoredFingerprint, RepoError> {
                Ok(StoredFingerprint {
                    seq: r.try_get("seq")?,
                    photo_id: r.try_get("photo_id")?,
                    fingerprint: Fingerprint::from_bytes(r.try_get("hash")?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Registration { seq, earlier })
    }
}
