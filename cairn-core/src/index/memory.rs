use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
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

#[derive(Debug, Clone)]
struct QueueRow {
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    attempts: u32,
    claim: Option<UploadClaim>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Every file row ever written, including soft-deleted history.
    files: Vec<FileRecord>,
    contents: HashMap<ContentHash, ContentRecord>,
    queue: HashMap<ContentHash, QueueRow>,
}

impl Tables {
    fn active_position(&self, path: &Path) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.path == path && f.deleted_at.is_none())
    }

    fn adjust_refs(&mut self, hash: &ContentHash, delta: i64) {
        if let Some(content) = self.contents.get_mut(hash) {
            content.ref_count = (content.ref_count + delta).max(0);
        }
    }

    fn find_or_create(
        &mut self,
        hash: &ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> (ContentRecord, bool) {
        let mut created = false;
        let content = self
            .contents
            .entry(hash.clone())
            .or_insert_with(|| {
                created = true;
                let mut record =
                    ContentRecord::new_pending(hash.clone(), size_bytes, extension, mime_type);
                record.created_at = now;
                record
            })
            .clone();

        if content.status != UploadStatus::Uploaded {
            self.queue.entry(hash.clone()).or_insert_with(|| QueueRow {
                enqueued_at: now,
                available_at: now,
                attempts: 0,
                claim: None,
            });
        }
        (content, created)
    }

    fn upsert(&mut self, upsert: FileUpsert, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        if !self.contents.contains_key(&upsert.content_hash) {
            return Err(SyncError::NotFound(format!(
                "content {} does not exist",
                upsert.content_hash
            )));
        }

        if let Some(pos) = self.active_position(&upsert.path) {
            let previous = self.files[pos].content_hash.clone();
            let record = &mut self.files[pos];
            let changed = upsert.differs_from(record);
            upsert.apply_to(record);
            record.last_seen_at = now;
            let transition = if previous != upsert.content_hash {
                FileTransition::ContentChanged { previous }
            } else if changed {
                FileTransition::MetadataChanged
            } else {
                FileTransition::Unchanged
            };
            if transition != FileTransition::Unchanged {
                record.updated_at = now;
            }
            let record = record.clone();
            if let FileTransition::ContentChanged { previous } = &transition {
                self.adjust_refs(previous, -1);
                self.adjust_refs(&upsert.content_hash, 1);
            }
            return Ok(UpsertOutcome { record, transition });
        }

        let revived = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.path == upsert.path)
            .max_by_key(|(_, f)| f.updated_at)
            .map(|(pos, _)| pos);

        let (record, transition) = match revived {
            Some(pos) => {
                let record = &mut self.files[pos];
                upsert.apply_to(record);
                record.deleted_at = None;
                record.last_seen_at = now;
                record.updated_at = now;
                (record.clone(), FileTransition::Reactivated)
            }
            None => {
                let record = FileRecord {
                    id: Uuid::now_v7(),
                    path: upsert.path.clone(),
                    filename: upsert.filename.clone(),
                    folder_path: upsert.folder_path.clone(),
                    size_bytes: upsert.size_bytes,
                    owner_uid: upsert.owner_uid,
                    group_gid: upsert.group_gid,
                    owner_name: upsert.owner_name.clone(),
                    group_name: upsert.group_name.clone(),
                    mode: upsert.mode,
                    inode: upsert.inode,
                    fs_ctime: upsert.fs_ctime,
                    fs_mtime: upsert.fs_mtime,
                    content_hash: upsert.content_hash.clone(),
                    deleted_at: None,
                    last_seen_at: now,
                    updated_at: now,
                };
                self.files.push(record.clone());
                (record, FileTransition::Created)
            }
        };
        self.adjust_refs(&upsert.content_hash, 1);
        Ok(UpsertOutcome { record, transition })
    }

    fn soft_delete(&mut self, path: &Path, now: DateTime<Utc>) -> Option<FileRecord> {
        let pos = self.active_position(path)?;
        let before = self.files[pos].clone();
        let record = &mut self.files[pos];
        record.deleted_at = Some(now);
        record.updated_at = now;
        self.adjust_refs(&before.content_hash, -1);
        Some(before)
    }

    fn check_claim(&self, hash: &ContentHash, presented: Option<ClaimToken>) -> Result<()> {
        let held = self
            .queue
            .get(hash)
            .and_then(|row| row.claim.as_ref())
            .map(|claim| claim.token);
        check_claim(hash, held, presented)
    }
}

/// Metadata index held in process memory. All operations take one lock, so
/// each call is atomic with respect to every other call.
///
/// Carries a settable clock and failure injection for exercising claim
/// expiry and upload compensation in tests.
#[derive(Debug, Default)]
pub struct InMemoryMetadataIndex {
    tables: Mutex<Tables>,
    clock_offset: Mutex<chrono::Duration>,
    fail_mark_uploaded: AtomicU32,
}

impl InMemoryMetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }

    /// Moves the index clock forward, e.g. past a claim expiry.
    pub fn advance_clock(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut offset = self.clock_offset.lock();
        *offset += by;
    }

    /// Makes the next `count` calls to `mark_content_uploaded` fail.
    pub fn fail_next_mark_uploaded(&self, count: u32) {
        self.fail_mark_uploaded.store(count, Ordering::SeqCst);
    }

    /// Every file row, including soft-deleted ones.
    pub fn file_records(&self) -> Vec<FileRecord> {
        self.tables.lock().files.clone()
    }

    pub fn content_records(&self) -> Vec<ContentRecord> {
        self.tables.lock().contents.values().cloned().collect()
    }

    pub fn queued_hashes(&self) -> Vec<ContentHash> {
        let mut hashes: Vec<_> = self.tables.lock().queue.keys().cloned().collect();
        hashes.sort();
        hashes
    }
}

#[async_trait]
impl MetadataIndex for InMemoryMetadataIndex {
    async fn upsert_file_record(&self, upsert: FileUpsert) -> Result<UpsertOutcome> {
        path_key(&upsert.path)?;
        let now = self.now();
        self.tables.lock().upsert(upsert, now)
    }

    async fn find_or_create_content_record(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
    ) -> Result<(ContentRecord, bool)> {
        let now = self.now();
        Ok(self
            .tables
            .lock()
            .find_or_create(hash, size_bytes, extension, mime_type, now))
    }

    async fn register_file(&self, registration: Registration) -> Result<RegistrationResult> {
        path_key(&registration.file.path)?;
        let now = self.now();
        let mut tables = self.tables.lock();
        let (_, content_created) = tables.find_or_create(
            &registration.file.content_hash,
            registration.file.size_bytes,
            &registration.extension,
            registration.mime_type.as_deref(),
            now,
        );
        let hash = registration.file.content_hash.clone();
        let file = tables.upsert(registration.file, now)?;
        let content = tables
            .contents
            .get(&hash)
            .cloned()
            .ok_or_else(|| SyncError::Internal(format!("content {hash} vanished")))?;
        Ok(RegistrationResult {
            file,
            content,
            content_created,
        })
    }

    async fn soft_delete_file_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        let now = self.now();
        Ok(self.tables.lock().soft_delete(path, now))
    }

    async fn update_file_record_path(
        &self,
        old_path: &Path,
        new_path: &Path,
        folder_path: &str,
    ) -> Result<Option<FileRecord>> {
        path_key(new_path)?;
        let now = self.now();
        let mut tables = self.tables.lock();
        let Some(pos) = tables.active_position(old_path) else {
            return Ok(None);
        };
        if old_path != new_path {
            tables.soft_delete(new_path, now);
        }
        let record = &mut tables.files[pos];
        record.path = new_path.to_path_buf();
        if let Some(name) = new_path.file_name().and_then(|n| n.to_str()) {
            record.filename = name.to_string();
        }
        record.folder_path = folder_path.to_string();
        record.last_seen_at = now;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn claim_upload_batch(
        &self,
        owner: &str,
        limit: usize,
        claim_duration: Duration,
    ) -> Result<Vec<UploadQueueEntry>> {
        let now = self.now();
        let expires_at = now
            + chrono::Duration::from_std(claim_duration)
                .map_err(|e| SyncError::InvalidInput(format!("claim duration: {e}")))?;
        let token = ClaimToken::new();
        let mut tables = self.tables.lock();

        let mut eligible: Vec<(ContentHash, DateTime<Utc>)> = tables
            .queue
            .iter()
            .filter(|(_, row)| {
                row.available_at <= now
                    && row.claim.as_ref().is_none_or(|c| c.expires_at < now)
            })
            .map(|(hash, row)| (hash.clone(), row.enqueued_at))
            .collect();
        eligible.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (hash, _) in eligible {
            let claim = UploadClaim {
                token,
                owner: owner.to_string(),
                expires_at,
            };
            let Some(row) = tables.queue.get_mut(&hash) else {
                continue;
            };
            row.attempts += 1;
            row.claim = Some(claim.clone());
            let (enqueued_at, attempts) = (row.enqueued_at, row.attempts);

            let Some(content) = tables.contents.get_mut(&hash) else {
                continue;
            };
            if matches!(content.status, UploadStatus::Failed | UploadStatus::Skipped) {
                content.status = UploadStatus::Pending;
            }
            let (storage_key, size_bytes, mime_type) = (
                content.storage_key.clone(),
                content.size_bytes,
                content.mime_type.clone(),
            );

            let source_path = tables
                .files
                .iter()
                .filter(|f| f.deleted_at.is_none() && f.content_hash == hash)
                .map(|f| f.path.clone())
                .min();

            claimed.push(UploadQueueEntry {
                content_hash: hash,
                storage_key,
                size_bytes,
                source_path,
                mime_type,
                enqueued_at,
                attempts,
                claim: Some(claim),
            });
        }
        Ok(claimed)
    }

    async fn mark_content_uploaded(
        &self,
        hash: &ContentHash,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let injected = self
            .fail_mark_uploaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::Database("injected mark_content_uploaded failure".into()));
        }

        let now = self.now();
        let mut tables = self.tables.lock();
        tables.check_claim(hash, claim)?;
        let content = tables
            .contents
            .get_mut(hash)
            .ok_or_else(|| SyncError::NotFound(format!("content {hash}")))?;
        content.status = UploadStatus::Uploaded;
        content.uploaded_at = Some(now);
        content.last_error = None;
        tables.queue.remove(hash);
        Ok(())
    }

    async fn mark_content_failed(
        &self,
        hash: &ContentHash,
        error: &str,
        retry_after: Duration,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let now = self.now();
        let retry_at = now + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::zero());
        let mut tables = self.tables.lock();
        tables.check_claim(hash, claim)?;
        let content = tables
            .contents
            .get_mut(hash)
            .ok_or_else(|| SyncError::NotFound(format!("content {hash}")))?;
        if content.status != UploadStatus::Uploaded {
            content.status = UploadStatus::Failed;
        }
        content.last_error = Some(error.to_string());
        if let Some(row) = tables.queue.get_mut(hash) {
            row.claim = None;
            row.available_at = retry_at;
        }
        Ok(())
    }

    async fn mark_content_skipped(
        &self,
        hash: &ContentHash,
        reason: &str,
        claim: Option<ClaimToken>,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.check_claim(hash, claim)?;
        let content = tables
            .contents
            .get_mut(hash)
            .ok_or_else(|| SyncError::NotFound(format!("content {hash}")))?;
        if content.status != UploadStatus::Uploaded {
            content.status = UploadStatus::Skipped;
        }
        content.last_error = Some(reason.to_string());
        tables.queue.remove(hash);
        Ok(())
    }

    async fn list_active_files(&self) -> Result<Vec<ActiveFile>> {
        let mut files: Vec<ActiveFile> = self
            .tables
            .lock()
            .files
            .iter()
            .filter(|f| f.is_active())
            .map(ActiveFile::from)
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn get_file_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        let tables = self.tables.lock();
        if let Some(pos) = tables.active_position(path) {
            return Ok(Some(tables.files[pos].clone()));
        }
        Ok(tables
            .files
            .iter()
            .filter(|f| f.path == path)
            .max_by_key(|f| f.updated_at)
            .cloned())
    }

    async fn get_content_record(&self, hash: &ContentHash) -> Result<Option<ContentRecord>> {
        Ok(self.tables.lock().contents.get(hash).cloned())
    }

    async fn release_expired_claims(&self) -> Result<u64> {
        let now = self.now();
        let mut released = 0;
        for row in self.tables.lock().queue.values_mut() {
            if row.claim.as_ref().is_some_and(|c| c.expires_at < now) {
                row.claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn queue_depth(&self) -> Result<u64> {
        Ok(self.tables.lock().queue.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hash(byte: char) -> ContentHash {
        ContentHash::parse(&byte.to_string().repeat(64)).unwrap()
    }

    fn upsert(path: &str, content: &ContentHash) -> FileUpsert {
        FileUpsert {
            path: PathBuf::from(path),
            filename: Path::new(path).file_name().unwrap().to_str().unwrap().into(),
            folder_path: "docs".into(),
            size_bytes: 5,
            owner_uid: 1000,
            group_gid: 100,
            owner_name: Some("alice".into()),
            group_name: None,
            mode: 0o644,
            inode: 42,
            fs_ctime: None,
            fs_mtime: DateTime::UNIX_EPOCH,
            content_hash: content.clone(),
        }
    }

    fn registration(path: &str, content: &ContentHash) -> Registration {
        Registration {
            file: upsert(path, content),
            extension: ".txt".into(),
            mime_type: Some("text/plain".into()),
        }
    }

    #[tokio::test]
    async fn reregistering_same_content_does_not_double_count() {
        let index = InMemoryMetadataIndex::new();
        let h = hash('a');
        let first = index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        assert!(first.content_created);
        assert_eq!(first.file.transition, FileTransition::Created);

        let second = index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        assert!(!second.content_created);
        assert_eq!(second.file.transition, FileTransition::Unchanged);
        assert_eq!(second.content.ref_count, 1);
    }

    #[tokio::test]
    async fn content_change_moves_reference() {
        let index = InMemoryMetadataIndex::new();
        let (old, new) = (hash('a'), hash('b'));
        index.register_file(registration("/r/a.txt", &old)).await.unwrap();
        let result = index.register_file(registration("/r/a.txt", &new)).await.unwrap();

        assert_eq!(
            result.file.transition,
            FileTransition::ContentChanged { previous: old.clone() }
        );
        assert_eq!(index.get_content_record(&old).await.unwrap().unwrap().ref_count, 0);
        assert_eq!(result.content.ref_count, 1);
    }

    #[tokio::test]
    async fn upsert_requires_existing_content() {
        let index = InMemoryMetadataIndex::new();
        let err = index.upsert_file_record(upsert("/r/a.txt", &hash('c'))).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn soft_deleted_path_is_reactivated_not_duplicated() {
        let index = InMemoryMetadataIndex::new();
        let h = hash('a');
        index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        index.soft_delete_file_record(Path::new("/r/a.txt")).await.unwrap().unwrap();
        assert_eq!(index.get_content_record(&h).await.unwrap().unwrap().ref_count, 0);

        let result = index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        assert_eq!(result.file.transition, FileTransition::Reactivated);
        assert!(result.file.record.deleted_at.is_none());
        assert_eq!(index.file_records().len(), 1);
        assert_eq!(result.content.ref_count, 1);
    }

    #[tokio::test]
    async fn claims_are_exclusive_until_expiry() {
        let index = InMemoryMetadataIndex::new();
        index.register_file(registration("/r/a.txt", &hash('a'))).await.unwrap();

        let first = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source_path.as_deref(), Some(Path::new("/r/a.txt")));
        assert!(index.claim_upload_batch("w2", 5, Duration::from_secs(60)).await.unwrap().is_empty());

        index.advance_clock(Duration::from_secs(61));
        let again = index.claim_upload_batch("w2", 5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn failed_entry_waits_for_retry_window() {
        let index = InMemoryMetadataIndex::new();
        let h = hash('a');
        index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap();
        index.mark_content_failed(&h, "boom", Duration::from_secs(30), None).await.unwrap();

        let content = index.get_content_record(&h).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Failed);
        assert!(index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap().is_empty());

        index.advance_clock(Duration::from_secs(31));
        assert_eq!(index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap().len(), 1);
        let content = index.get_content_record(&h).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Pending);
    }

    #[tokio::test]
    async fn move_replaces_record_at_destination() {
        let index = InMemoryMetadataIndex::new();
        let (a, b) = (hash('a'), hash('b'));
        index.register_file(registration("/r/old.txt", &a)).await.unwrap();
        index.register_file(registration("/r/new.txt", &b)).await.unwrap();

        let moved = index
            .update_file_record_path(Path::new("/r/old.txt"), Path::new("/r/new.txt"), "docs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.content_hash, a);
        assert_eq!(moved.filename, "new.txt");
        assert_eq!(index.list_active_paths().await.unwrap(), vec![PathBuf::from("/r/new.txt")]);
        assert_eq!(index.get_content_record(&b).await.unwrap().unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn release_expired_claims_counts_released_rows() {
        let index = InMemoryMetadataIndex::new();
        index.register_file(registration("/r/a.txt", &hash('a'))).await.unwrap();
        index.register_file(registration("/r/b.txt", &hash('b'))).await.unwrap();
        index.claim_upload_batch("w1", 1, Duration::from_secs(10)).await.unwrap();

        assert_eq!(index.release_expired_claims().await.unwrap(), 0);
        index.advance_clock(Duration::from_secs(11));
        assert_eq!(index.release_expired_claims().await.unwrap(), 1);
        assert_eq!(index.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn move_across_directories_refiles_the_record() {
        let index = InMemoryMetadataIndex::new();
        index.register_file(registration("/r/docs/a.txt", &hash('a'))).await.unwrap();

        let moved = index
            .update_file_record_path(
                Path::new("/r/docs/a.txt"),
                Path::new("/r/docs/archive/a.txt"),
                "docs/archive",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.folder_path, "docs/archive");
        let stored = index
            .get_file_record(Path::new("/r/docs/archive/a.txt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.folder_path, "docs/archive");
    }

    #[tokio::test]
    async fn stale_claim_cannot_complete_or_fail_a_reclaimed_entry() {
        let index = InMemoryMetadataIndex::new();
        let h = hash('a');
        index.register_file(registration("/r/a.txt", &h)).await.unwrap();

        let stale = index.claim_upload_batch("w1", 5, Duration::from_secs(10)).await.unwrap();
        index.advance_clock(Duration::from_secs(11));
        let fresh = index.claim_upload_batch("w2", 5, Duration::from_secs(60)).await.unwrap();

        let err = index
            .mark_content_uploaded(&h, stale[0].claim_token())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ClaimLost(_)));
        let err = index
            .mark_content_failed(&h, "late", Duration::from_secs(5), stale[0].claim_token())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ClaimLost(_)));
        assert_eq!(index.get_content_record(&h).await.unwrap().unwrap().status, UploadStatus::Pending);

        index.mark_content_uploaded(&h, fresh[0].claim_token()).await.unwrap();
        assert_eq!(index.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skipped_content_leaves_the_queue_until_registered_again() {
        let index = InMemoryMetadataIndex::new();
        let h = hash('a');
        index.register_file(registration("/r/a.txt", &h)).await.unwrap();
        let claimed = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed[0].mime_type.as_deref(), Some("text/plain"));

        index
            .mark_content_skipped(&h, "too large", claimed[0].claim_token())
            .await
            .unwrap();
        let content = index.get_content_record(&h).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Skipped);
        assert_eq!(content.last_error.as_deref(), Some("too large"));
        assert_eq!(index.queue_depth().await.unwrap(), 0);

        index.register_file(registration("/r/b.txt", &h)).await.unwrap();
        let requeued = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(index.get_content_record(&h).await.unwrap().unwrap().status, UploadStatus::Pending);
    }
}
