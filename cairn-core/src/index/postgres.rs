//! Postgres-backed metadata index.
//!
//! Registration, soft-delete and move take a transaction-scoped advisory
//! lock on the path, so two producers touching the same path serialize at
//! the database. Reference counts are only ever changed by single-row
//! `UPDATE ... SET ref_count = ref_count + n` statements inside those
//! transactions. Upload claims use `FOR UPDATE SKIP LOCKED`.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, postgres::PgPoolOptions};
use tracing::{debug, info};
use uuid::Uuid;

use super::{MetadataIndex, check_claim, path_key};
use crate::{
    error::{Result, SyncError},
    model::{
        ActiveFile, ClaimToken, ContentHash, ContentRecord, FileRecord,
        FileTransition, FileUpsert, Registration, RegistrationResult,
        UploadClaim, UploadQueueEntry, UploadStatus, UpsertOutcome,
    },
};

const FILE_COLUMNS: &str = "id, path, filename, folder_path, size_bytes, \
     owner_uid, group_gid, owner_name, group_name, mode, inode, fs_ctime, \
     fs_mtime, content_hash, deleted_at, last_seen_at, updated_at";

const CONTENT_COLUMNS: &str = "content_hash, size_bytes, extension, \
     storage_key, mime_type, status, ref_count, last_error, uploaded_at, created_at";

// Unsigned filesystem values are stored bit-for-bit in signed BIGINT columns.
fn to_db(value: u64) -> i64 {
    value as i64
}

fn from_db(value: i64) -> u64 {
    value as u64
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    path: String,
    filename: String,
    folder_path: String,
    size_bytes: i64,
    owner_uid: i64,
    group_gid: i64,
    owner_name: Option<String>,
    group_name: Option<String>,
    mode: i32,
    inode: i64,
    fs_ctime: Option<DateTime<Utc>>,
    fs_mtime: DateTime<Utc>,
    content_hash: String,
    deleted_at: Option<DateTime<Utc>>,
    last_seen_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = SyncError;

    fn try_from(row: FileRow) -> Result<Self> {
        Ok(FileRecord {
            id: row.id,
            path: PathBuf::from(row.path),
            filename: row.filename,
            folder_path: row.folder_path,
            size_bytes: from_db(row.size_bytes),
            owner_uid: row.owner_uid as u32,
            group_gid: row.group_gid as u32,
            owner_name: row.owner_name,
            group_name: row.group_name,
            mode: row.mode as u32,
            inode: from_db(row.inode),
            fs_ctime: row.fs_ctime,
            fs_mtime: row.fs_mtime,
            content_hash: ContentHash::parse(&row.content_hash)?,
            deleted_at: row.deleted_at,
            last_seen_at: row.last_seen_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    content_hash: String,
    size_bytes: i64,
    extension: String,
    storage_key: String,
    mime_type: Option<String>,
    status: String,
    ref_count: i64,
    last_error: Option<String>,
    uploaded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ContentRow> for ContentRecord {
    type Error = SyncError;

    fn try_from(row: ContentRow) -> Result<Self> {
        let status = UploadStatus::parse(&row.status).ok_or_else(|| {
            SyncError::Database(format!("unknown upload status {:?}", row.status))
        })?;
        Ok(ContentRecord {
            hash: ContentHash::parse(&row.content_hash)?,
            size_bytes: from_db(row.size_bytes),
            extension: row.extension,
            storage_key: row.storage_key,
            mime_type: row.mime_type,
            status,
            ref_count: row.ref_count,
            last_error: row.last_error,
            uploaded_at: row.uploaded_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActiveRow {
    path: String,
    size_bytes: i64,
    inode: i64,
    fs_ctime: Option<DateTime<Utc>>,
    fs_mtime: DateTime<Utc>,
    content_hash: String,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    content_hash: String,
    enqueued_at: DateTime<Utc>,
    attempts: i32,
    claim_expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ClaimDetailRow {
    content_hash: String,
    storage_key: String,
    size_bytes: i64,
    mime_type: Option<String>,
    source_path: Option<String>,
}

/// Metadata index over a shared connection pool. Each operation checks out
/// its own connection, so concurrent workers never interleave requests on
/// one session.
#[derive(Clone)]
pub struct PostgresMetadataIndex {
    pool: PgPool,
}

impl fmt::Debug for PostgresMetadataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresMetadataIndex")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresMetadataIndex {
    /// Wraps an existing pool after a health check.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                SyncError::Database(format!(
                    "metadata index failed Postgres health check: {e}"
                ))
            })?;
        info!("Metadata index connected to Postgres");
        Ok(Self { pool })
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| SyncError::Database(format!("connect failed: {e}")))?;
        Self::new(pool).await
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Database(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_path(conn: &mut PgConnection, path: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(path)
            .execute(&mut *conn)
            .await
            .map_err(|e| SyncError::Database(format!("path lock failed: {e}")))?;
        Ok(())
    }

    async fn adjust_refs(conn: &mut PgConnection, hash: &ContentHash, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE file_contents \
             SET ref_count = GREATEST(ref_count + $2, 0), updated_at = NOW() \
             WHERE content_hash = $1",
        )
        .bind(hash.as_str())
        .bind(delta)
        .execute(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("ref count update failed: {e}")))?;
        Ok(())
    }

    async fn find_or_create_in(
        conn: &mut PgConnection,
        hash: &ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
    ) -> Result<(ContentRecord, bool)> {
        let storage_key = crate::model::storage_key(hash, extension);
        let inserted: Option<ContentRow> = sqlx::query_as(&format!(
            "INSERT INTO file_contents (content_hash, size_bytes, extension, storage_key, mime_type) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (content_hash) DO NOTHING \
             RETURNING {CONTENT_COLUMNS}"
        ))
        .bind(hash.as_str())
        .bind(to_db(size_bytes))
        .bind(extension)
        .bind(&storage_key)
        .bind(mime_type)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("content insert failed: {e}")))?;

        let (row, created) = match inserted {
            Some(row) => (row, true),
            None => {
                let row: ContentRow = sqlx::query_as(&format!(
                    "SELECT {CONTENT_COLUMNS} FROM file_contents WHERE content_hash = $1"
                ))
                .bind(hash.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| SyncError::Database(format!("content lookup failed: {e}")))?;
                (row, false)
            }
        };
        let content = ContentRecord::try_from(row)?;

        if content.status != UploadStatus::Uploaded {
            sqlx::query(
                "INSERT INTO upload_queue (content_hash) VALUES ($1) \
                 ON CONFLICT (content_hash) DO NOTHING",
            )
            .bind(hash.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| SyncError::Database(format!("enqueue upload failed: {e}")))?;
        }

        Ok((content, created))
    }

    async fn active_file_for_update(conn: &mut PgConnection, path: &str) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(&format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE path = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(path)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("file lookup failed: {e}")))?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn write_file(
        conn: &mut PgConnection,
        id: Uuid,
        upsert: &FileUpsert,
        insert: bool,
        touch_updated: bool,
    ) -> Result<FileRecord> {
        let sql = if insert {
            format!(
                "INSERT INTO files (id, path, filename, folder_path, size_bytes, \
                     owner_uid, group_gid, mode, inode, fs_ctime, fs_mtime, content_hash, \
                     owner_name, group_name) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                 RETURNING {FILE_COLUMNS}"
            )
        } else {
            format!(
                "UPDATE files SET path = $2, filename = $3, folder_path = $4, \
                     size_bytes = $5, owner_uid = $6, group_gid = $7, mode = $8, \
                     inode = $9, fs_ctime = $10, fs_mtime = $11, content_hash = $12, \
                     owner_name = $13, group_name = $14, \
                     deleted_at = NULL, last_seen_at = NOW(), \
                     updated_at = CASE WHEN $15 THEN NOW() ELSE updated_at END \
                 WHERE id = $1 \
                 RETURNING {FILE_COLUMNS}"
            )
        };
        let mut query = sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .bind(path_key(&upsert.path)?)
            .bind(&upsert.filename)
            .bind(&upsert.folder_path)
            .bind(to_db(upsert.size_bytes))
            .bind(i64::from(upsert.owner_uid))
            .bind(i64::from(upsert.group_gid))
            .bind(upsert.mode as i32)
            .bind(to_db(upsert.inode))
            .bind(upsert.fs_ctime)
            .bind(upsert.fs_mtime)
            .bind(upsert.content_hash.as_str())
            .bind(upsert.owner_name.as_deref())
            .bind(upsert.group_name.as_deref());
        if !insert {
            query = query.bind(touch_updated);
        }
        let row = query
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| SyncError::Database(format!("file write failed: {e}")))?;
        FileRecord::try_from(row)
    }

    async fn upsert_in(conn: &mut PgConnection, upsert: FileUpsert) -> Result<UpsertOutcome> {
        let path = path_key(&upsert.path)?;

        if let Some(current) = Self::active_file_for_update(conn, path).await? {
            let changed = upsert.differs_from(&current);
            let transition = if current.content_hash != upsert.content_hash {
                FileTransition::ContentChanged {
                    previous: current.content_hash.clone(),
                }
            } else if changed {
                FileTransition::MetadataChanged
            } else {
                FileTransition::Unchanged
            };
            let record = Self::write_file(conn, current.id, &upsert, false, changed).await?;
            if let FileTransition::ContentChanged { previous } = &transition {
                Self::adjust_refs(conn, previous, -1).await?;
                Self::adjust_refs(conn, &upsert.content_hash, 1).await?;
            }
            return Ok(UpsertOutcome { record, transition });
        }

        let revived: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM files WHERE path = $1 \
             ORDER BY updated_at DESC LIMIT 1 FOR UPDATE",
        )
        .bind(path)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("history lookup failed: {e}")))?;

        let (record, transition) = match revived {
            Some(id) => (
                Self::write_file(conn, id, &upsert, false, true).await?,
                FileTransition::Reactivated,
            ),
            None => (
                Self::write_file(conn, Uuid::now_v7(), &upsert, true, true).await?,
                FileTransition::Created,
            ),
        };
        Self::adjust_refs(conn, &upsert.content_hash, 1).await?;
        Ok(UpsertOutcome { record, transition })
    }

    /// Locks the queue row and rejects a presented token that no longer
    /// holds it.
    async fn check_claim_in(
        conn: &mut PgConnection,
        hash: &ContentHash,
        presented: Option<ClaimToken>,
    ) -> Result<()> {
        if presented.is_none() {
            return Ok(());
        }
        let held: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT claim_token FROM upload_queue WHERE content_hash = $1 FOR UPDATE",
        )
        .bind(hash.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("claim lookup failed: {e}")))?;
        check_claim(hash, held.flatten().map(ClaimToken), presented)
    }

    async fn soft_delete_in(conn: &mut PgConnection, path: &str) -> Result<Option<FileRecord>> {
        let Some(before) = Self::active_file_for_update(conn, path).await? else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE files SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(before.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| SyncError::Database(format!("soft delete failed: {e}")))?;
        Self::adjust_refs(conn, &before.content_hash, -1).await?;
        Ok(Some(before))
    }
}

#[async_trait]
impl MetadataIndex for PostgresMetadataIndex {
    async fn upsert_file_record(&self, upsert: FileUpsert) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin upsert tx failed: {e}"))
        })?;
        Self::lock_path(&mut tx, path_key(&upsert.path)?).await?;
        let outcome = Self::upsert_in(&mut tx, upsert).await?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("upsert tx commit failed: {e}"))
        })?;
        Ok(outcome)
    }

    async fn find_or_create_content_record(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
    ) -> Result<(ContentRecord, bool)> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin content tx failed: {e}"))
        })?;
        let found =
            Self::find_or_create_in(&mut tx, hash, size_bytes, extension, mime_type).await?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("content tx commit failed: {e}"))
        })?;
        Ok(found)
    }

    async fn register_file(&self, registration: Registration) -> Result<RegistrationResult> {
        let Registration {
            file,
            extension,
            mime_type,
        } = registration;
        let hash = file.content_hash.clone();

        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin register tx failed: {e}"))
        })?;
        Self::lock_path(&mut tx, path_key(&file.path)?).await?;
        let (_, content_created) = Self::find_or_create_in(
            &mut tx,
            &hash,
            file.size_bytes,
            &extension,
            mime_type.as_deref(),
        )
        .await?;
        let outcome = Self::upsert_in(&mut tx, file).await?;
        let content: ContentRow = sqlx::query_as(&format!(
            "SELECT {CONTENT_COLUMNS} FROM file_contents WHERE content_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("content reload failed: {e}")))?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("register tx commit failed: {e}"))
        })?;

        Ok(RegistrationResult {
            file: outcome,
            content: ContentRecord::try_from(content)?,
            content_created,
        })
    }

    async fn soft_delete_file_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        let key = path_key(path)?;
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin soft delete tx failed: {e}"))
        })?;
        Self::lock_path(&mut tx, key).await?;
        let deleted = Self::soft_delete_in(&mut tx, key).await?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("soft delete tx commit failed: {e}"))
        })?;
        Ok(deleted)
    }

    async fn update_file_record_path(
        &self,
        old_path: &Path,
        new_path: &Path,
        folder_path: &str,
    ) -> Result<Option<FileRecord>> {
        let (old_key, new_key) = (path_key(old_path)?, path_key(new_path)?);
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin move tx failed: {e}"))
        })?;

        // Fixed lock order keeps two opposite moves from deadlocking.
        let (first, second) = if old_key <= new_key {
            (old_key, new_key)
        } else {
            (new_key, old_key)
        };
        Self::lock_path(&mut tx, first).await?;
        if first != second {
            Self::lock_path(&mut tx, second).await?;
        }

        let Some(current) = Self::active_file_for_update(&mut tx, old_key).await? else {
            tx.commit().await.map_err(|e| {
                SyncError::Database(format!("move tx commit failed: {e}"))
            })?;
            return Ok(None);
        };
        if old_key != new_key {
            Self::soft_delete_in(&mut tx, new_key).await?;
        }

        let filename = new_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&current.filename)
            .to_string();
        let row: FileRow = sqlx::query_as(&format!(
            "UPDATE files SET path = $2, filename = $3, folder_path = $4, \
                 last_seen_at = NOW(), updated_at = NOW() \
             WHERE id = $1 RETURNING {FILE_COLUMNS}"
        ))
        .bind(current.id)
        .bind(new_key)
        .bind(&filename)
        .bind(folder_path)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("move update failed: {e}")))?;

        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("move tx commit failed: {e}"))
        })?;
        FileRecord::try_from(row).map(Some)
    }

    async fn claim_upload_batch(
        &self,
        owner: &str,
        limit: usize,
        claim_duration: Duration,
    ) -> Result<Vec<UploadQueueEntry>> {
        let token = ClaimToken::new();
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin claim tx failed: {e}"))
        })?;

        let claimed: Vec<ClaimedRow> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT content_hash
                FROM upload_queue
                WHERE available_at <= NOW()
                  AND (claim_expires_at IS NULL OR claim_expires_at < NOW())
                ORDER BY enqueued_at, content_hash
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE upload_queue q
            SET claim_token = $2,
                claim_owner = $3,
                claim_expires_at = NOW() + make_interval(secs => $4),
                attempts = q.attempts + 1
            FROM picked
            WHERE q.content_hash = picked.content_hash
            RETURNING q.content_hash, q.enqueued_at, q.attempts, q.claim_expires_at
            "#,
        )
        .bind(limit as i64)
        .bind(token.0)
        .bind(owner)
        .bind(claim_duration.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("claim failed: {e}")))?;

        if claimed.is_empty() {
            tx.commit().await.map_err(|e| {
                SyncError::Database(format!("claim tx commit failed: {e}"))
            })?;
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = claimed.iter().map(|row| row.content_hash.clone()).collect();

        sqlx::query(
            "UPDATE file_contents SET status = 'pending', updated_at = NOW() \
             WHERE content_hash = ANY($1) AND status IN ('failed', 'skipped')",
        )
        .bind(&hashes)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("claim status reset failed: {e}")))?;

        let details: Vec<ClaimDetailRow> = sqlx::query_as(
            r#"
            SELECT c.content_hash, c.storage_key, c.size_bytes, c.mime_type,
                   (SELECT f.path FROM files f
                    WHERE f.content_hash = c.content_hash AND f.deleted_at IS NULL
                    ORDER BY f.path LIMIT 1) AS source_path
            FROM file_contents c
            WHERE c.content_hash = ANY($1)
            "#,
        )
        .bind(&hashes)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("claim detail lookup failed: {e}")))?;

        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("claim tx commit failed: {e}"))
        })?;

        let mut entries = Vec::with_capacity(claimed.len());
        for row in claimed {
            let Some(detail) = details.iter().find(|d| d.content_hash == row.content_hash) else {
                continue;
            };
            entries.push(UploadQueueEntry {
                content_hash: ContentHash::parse(&row.content_hash)?,
                storage_key: detail.storage_key.clone(),
                size_bytes: from_db(detail.size_bytes),
                source_path: detail.source_path.as_ref().map(PathBuf::from),
                mime_type: detail.mime_type.clone(),
                enqueued_at: row.enqueued_at,
                attempts: row.attempts.max(0) as u32,
                claim: Some(UploadClaim {
                    token,
                    owner: owner.to_string(),
                    expires_at: row.claim_expires_at,
                }),
            });
        }
        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        debug!(owner, claimed = entries.len(), "claimed upload batch");
        Ok(entries)
    }

    async fn mark_content_uploaded(
        &self,
        hash: &ContentHash,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin mark uploaded tx failed: {e}"))
        })?;
        Self::check_claim_in(&mut tx, hash, claim).await?;
        let updated = sqlx::query(
            "UPDATE file_contents \
             SET status = 'uploaded', uploaded_at = NOW(), last_error = NULL, updated_at = NOW() \
             WHERE content_hash = $1",
        )
        .bind(hash.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("mark uploaded failed: {e}")))?;
        if updated.rows_affected() == 0 {
            drop(tx.rollback().await);
            return Err(SyncError::NotFound(format!("content {hash}")));
        }
        sqlx::query("DELETE FROM upload_queue WHERE content_hash = $1")
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(format!("dequeue upload failed: {e}")))?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("mark uploaded tx commit failed: {e}"))
        })
    }

    async fn mark_content_failed(
        &self,
        hash: &ContentHash,
        error: &str,
        retry_after: Duration,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin mark failed tx failed: {e}"))
        })?;
        Self::check_claim_in(&mut tx, hash, claim).await?;
        let updated = sqlx::query(
            "UPDATE file_contents \
             SET status = CASE WHEN status = 'uploaded' THEN status ELSE 'failed' END, \
                 last_error = $2, updated_at = NOW() \
             WHERE content_hash = $1",
        )
        .bind(hash.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("mark failed update failed: {e}")))?;
        if updated.rows_affected() == 0 {
            drop(tx.rollback().await);
            return Err(SyncError::NotFound(format!("content {hash}")));
        }
        sqlx::query(
            "UPDATE upload_queue \
             SET claim_token = NULL, claim_owner = NULL, claim_expires_at = NULL, \
                 available_at = NOW() + make_interval(secs => $2), last_error = $3 \
             WHERE content_hash = $1",
        )
        .bind(hash.as_str())
        .bind(retry_after.as_secs_f64())
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("release failed claim failed: {e}")))?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("mark failed tx commit failed: {e}"))
        })
    }

    async fn mark_content_skipped(
        &self,
        hash: &ContentHash,
        reason: &str,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            SyncError::Database(format!("begin mark skipped tx failed: {e}"))
        })?;
        Self::check_claim_in(&mut tx, hash, claim).await?;
        let updated = sqlx::query(
            "UPDATE file_contents \
             SET status = CASE WHEN status = 'uploaded' THEN status ELSE 'skipped' END, \
                 last_error = $2, updated_at = NOW() \
             WHERE content_hash = $1",
        )
        .bind(hash.as_str())
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(format!("mark skipped failed: {e}")))?;
        if updated.rows_affected() == 0 {
            drop(tx.rollback().await);
            return Err(SyncError::NotFound(format!("content {hash}")));
        }
        sqlx::query("DELETE FROM upload_queue WHERE content_hash = $1")
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Database(format!("dequeue skipped failed: {e}")))?;
        tx.commit().await.map_err(|e| {
            SyncError::Database(format!("mark skipped tx commit failed: {e}"))
        })
    }

    async fn list_active_files(&self) -> Result<Vec<ActiveFile>> {
        let rows: Vec<ActiveRow> = sqlx::query_as(
            "SELECT path, size_bytes, inode, fs_ctime, fs_mtime, content_hash \
             FROM files WHERE deleted_at IS NULL ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(format!("list active files failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                Ok(ActiveFile {
                    path: PathBuf::from(row.path),
                    size_bytes: from_db(row.size_bytes),
                    inode: from_db(row.inode),
                    fs_ctime: row.fs_ctime,
                    fs_mtime: row.fs_mtime,
                    content_hash: ContentHash::parse(&row.content_hash)?,
                })
            })
            .collect()
    }

    async fn get_file_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE path = $1 \
             ORDER BY (deleted_at IS NULL) DESC, updated_at DESC LIMIT 1"
        ))
        .bind(path_key(path)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(format!("file lookup failed: {e}")))?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn get_content_record(&self, hash: &ContentHash) -> Result<Option<ContentRecord>> {
        let row: Option<ContentRow> = sqlx::query_as(&format!(
            "SELECT {CONTENT_COLUMNS} FROM file_contents WHERE content_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(format!("content lookup failed: {e}")))?;
        row.map(ContentRecord::try_from).transpose()
    }

    async fn release_expired_claims(&self) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE upload_queue \
             SET claim_token = NULL, claim_owner = NULL, claim_expires_at = NULL \
             WHERE claim_expires_at < NOW()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(format!("release expired claims failed: {e}")))?;
        Ok(released.rows_affected())
    }

    async fn queue_depth(&self) -> Result<u64> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(format!("queue depth failed: {e}")))?;
        Ok(depth.max(0) as u64)
    }
}
