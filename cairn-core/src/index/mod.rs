//! Metadata index port.
//!
//! The index is the single source of truth for file records, content
//! records, reference counts and the upload queue. Every method is one
//! atomic operation against the backing store; the engine never coordinates
//! these through in-process locks.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{Result, SyncError},
    model::{
        ActiveFile, ClaimToken, ContentHash, ContentRecord, FileRecord, FileUpsert,
        Registration, RegistrationResult, UploadQueueEntry, UpsertOutcome,
    },
};

pub use memory::InMemoryMetadataIndex;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMetadataIndex;

#[async_trait]
pub trait MetadataIndex: fmt::Debug + Send + Sync {
    /// Points `path` at `upsert.content_hash`, adjusting reference counts on
    /// the old and new content exactly once per transition. Reactivates a
    /// soft-deleted record for the same path instead of inserting a new one.
    async fn upsert_file_record(&self, upsert: FileUpsert) -> Result<UpsertOutcome>;

    /// Returns the content record for `hash`, inserting it as `pending` with
    /// a zero reference count when absent. Content that is not yet uploaded
    /// always has an upload queue entry afterwards. The flag reports whether
    /// the record was created by this call.
    async fn find_or_create_content_record(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
    ) -> Result<(ContentRecord, bool)>;

    /// Content lookup/insert followed by the file upsert, as one unit.
    async fn register_file(&self, registration: Registration) -> Result<RegistrationResult>;

    /// Marks the active record at `path` deleted and releases its content
    /// reference. Returns the record as it was before deletion, or `None`
    /// when no active record existed.
    async fn soft_delete_file_record(&self, path: &Path) -> Result<Option<FileRecord>>;

    /// Renames the active record at `old_path` in place, keeping its content,
    /// and files it under `folder_path`. An active record already sitting at
    /// `new_path` is soft-deleted first. Returns `None` when `old_path` has
    /// no active record.
    async fn update_file_record_path(
        &self,
        old_path: &Path,
        new_path: &Path,
        folder_path: &str,
    ) -> Result<Option<FileRecord>>;

    /// Claims up to `limit` unclaimed (or expired) entries for `owner`.
    /// Mutually exclusive across concurrent callers and processes.
    async fn claim_upload_batch(
        &self,
        owner: &str,
        limit: usize,
        claim_duration: Duration,
    ) -> Result<Vec<UploadQueueEntry>>;

    /// Flags the content uploaded and removes its queue entry.
    ///
    /// With a `claim`, fails with [`SyncError::ClaimLost`] and changes
    /// nothing when the entry is now claimed under a different token.
    async fn mark_content_uploaded(
        &self,
        hash: &ContentHash,
        claim: Option<ClaimToken>,
    ) -> Result<()>;

    /// Flags the content failed, releases the claim and holds the entry back
    /// for `retry_after`. Claim handling as in `mark_content_uploaded`.
    async fn mark_content_failed(
        &self,
        hash: &ContentHash,
        error: &str,
        retry_after: Duration,
        claim: Option<ClaimToken>,
    ) -> Result<()>;

    /// Flags the content skipped and drops its queue entry. Nothing retries
    /// it until a path registers the content again. Claim handling as in
    /// `mark_content_uploaded`.
    async fn mark_content_skipped(
        &self,
        hash: &ContentHash,
        reason: &str,
        claim: Option<ClaimToken>,
    ) -> Result<()>;

    async fn list_active_files(&self) -> Result<Vec<ActiveFile>>;

    async fn list_active_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .list_active_files()
            .await?
            .into_iter()
            .map(|file| file.path)
            .collect())
    }

    /// Most recent record for `path`, active or soft-deleted.
    async fn get_file_record(&self, path: &Path) -> Result<Option<FileRecord>>;

    async fn get_content_record(&self, hash: &ContentHash) -> Result<Option<ContentRecord>>;

    /// Clears claims whose expiry has passed. Returns how many were released.
    async fn release_expired_claims(&self) -> Result<u64>;

    /// Entries still waiting for a successful upload.
    async fn queue_depth(&self) -> Result<u64>;
}

/// Postgres paths and the in-memory index both key records by the UTF-8 form
/// of the path.
pub(crate) fn path_key(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        SyncError::InvalidInput(format!(
            "path is not valid UTF-8: {}",
            path.display()
        ))
    })
}

/// Passes when no token is presented, when the entry is unclaimed, or when
/// it is still held under the presented token.
pub(crate) fn check_claim(
    hash: &ContentHash,
    held: Option<ClaimToken>,
    presented: Option<ClaimToken>,
) -> Result<()> {
    match (held, presented) {
        (Some(held), Some(presented)) if held != presented => Err(SyncError::ClaimLost(format!(
            "content {hash} is claimed under {held}, not {presented}"
        ))),
        _ => Ok(()),
    }
}
