//! Upload side of the worker pool: claim queue entries, stream the source
//! file into the blob store, and commit or compensate.
//!
//! The blob write and the index commit cannot share a transaction. When the
//! write succeeds and the commit fails, the blob is deleted again so the
//! store never holds an object the index does not know about. Results are
//! recorded under the worker's claim token; a worker whose claim was taken
//! over records nothing and leaves the blob to the new holder.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::{
    blob::BlobStore,
    config::{ClaimConfig, LimitsConfig, RetryConfig},
    error::{Result, SyncError},
    hasher::{CHUNK_SIZE, ContentHasher},
    index::MetadataIndex,
    model::{UploadQueueEntry, UploadStatus},
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64 },
    /// The key was already in the blob store; nothing was transferred.
    AlreadyPresent,
    /// The entry was marked failed and will be retried after a backoff.
    Failed { reason: String },
    /// Left out for good: no active source, or over the upload size cap.
    Skipped { reason: String },
    /// Another worker took over the claim; nothing was recorded.
    ClaimLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub claimed: usize,
    pub uploaded: usize,
    pub already_present: usize,
    pub failed: usize,
    pub skipped: usize,
    pub claim_lost: usize,
    /// Entries whose failure could not even be recorded; their claim expires.
    pub errors: usize,
    pub bytes: u64,
}

impl BatchStats {
    fn record(&mut self, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Uploaded { bytes } => {
                self.uploaded += 1;
                self.bytes += bytes;
            }
            UploadOutcome::AlreadyPresent => self.already_present += 1,
            UploadOutcome::Failed { .. } => self.failed += 1,
            UploadOutcome::Skipped { .. } => self.skipped += 1,
            UploadOutcome::ClaimLost => self.claim_lost += 1,
        }
    }

    fn absorb(&mut self, other: &BatchStats) {
        self.claimed += other.claimed;
        self.uploaded += other.uploaded;
        self.already_present += other.already_present;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.claim_lost += other.claim_lost;
        self.errors += other.errors;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Clone)]
pub struct Uploader {
    index: Arc<dyn MetadataIndex>,
    blobs: Arc<dyn BlobStore>,
    claims: ClaimConfig,
    retry: RetryConfig,
    limits: LimitsConfig,
}

impl Uploader {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        blobs: Arc<dyn BlobStore>,
        claims: ClaimConfig,
        retry: RetryConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            index,
            blobs,
            claims,
            retry,
            limits,
        }
    }

    /// Claims one batch for `owner` and processes every entry in it. A
    /// failing entry never stops the rest of the batch.
    pub async fn run_batch(&self, owner: &str) -> Result<BatchStats> {
        let entries = self
            .index
            .claim_upload_batch(owner, self.claims.batch_size, self.claims.claim_ttl())
            .await?;

        let mut stats = BatchStats {
            claimed: entries.len(),
            ..BatchStats::default()
        };
        if entries.is_empty() {
            return Ok(stats);
        }
        debug!(target: "cairn::upload", worker = %owner, claimed = entries.len(), "claimed upload batch");

        for entry in &entries {
            match self.process(entry).await {
                Ok(outcome) => stats.record(&outcome),
                Err(err) => {
                    error!(
                        target: "cairn::upload",
                        worker = %owner,
                        hash = %entry.content_hash,
                        error = %err,
                        "could not record upload result; claim will expire"
                    );
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Claims and processes batches until nothing is claimable.
    pub async fn drain(&self, owner: &str) -> Result<BatchStats> {
        let mut total = BatchStats::default();
        loop {
            let batch = self.run_batch(owner).await?;
            if batch.claimed == 0 {
                return Ok(total);
            }
            total.absorb(&batch);
        }
    }

    /// Transfers one claimed entry. Transfer failures mark the entry failed
    /// with a backoff and return [`UploadOutcome::Failed`]; an `Err` means
    /// the failure itself could not be recorded.
    pub async fn process(&self, entry: &UploadQueueEntry) -> Result<UploadOutcome> {
        let claim = entry.claim_token();
        if let Some(reason) = self.skip_reason(entry) {
            return match self
                .index
                .mark_content_skipped(&entry.content_hash, &reason, claim)
                .await
            {
                Ok(()) => {
                    info!(target: "cairn::upload", hash = %entry.content_hash, %reason, "upload skipped");
                    Ok(UploadOutcome::Skipped { reason })
                }
                Err(SyncError::ClaimLost(detail)) => Ok(claim_lost(entry, &detail)),
                Err(err) => Err(err),
            };
        }

        let err = match self.transfer(entry).await {
            Ok(outcome) => return Ok(outcome),
            Err(SyncError::ClaimLost(detail)) => return Ok(claim_lost(entry, &detail)),
            Err(err) => err,
        };
        let retry_after = self
            .retry
            .delay_for(entry.attempts.max(1), entry.content_hash.as_str());
        let reason = err.to_string();
        match &err {
            SyncError::CompensationFailed { .. } => {
                error!(target: "cairn::upload", hash = %entry.content_hash, key = %entry.storage_key, error = %err, "upload compensation failed; orphan blob left behind");
            }
            _ => {
                warn!(
                    target: "cairn::upload",
                    hash = %entry.content_hash,
                    key = %entry.storage_key,
                    attempts = entry.attempts,
                    retry_in_ms = retry_after.as_millis() as u64,
                    error = %err,
                    "upload failed"
                );
            }
        }
        match self
            .index
            .mark_content_failed(&entry.content_hash, &reason, retry_after, claim)
            .await
        {
            Ok(()) => Ok(UploadOutcome::Failed { reason }),
            Err(SyncError::ClaimLost(detail)) => Ok(claim_lost(entry, &detail)),
            Err(err) => Err(err),
        }
    }

    /// Entries that can never be uploaded as they stand.
    fn skip_reason(&self, entry: &UploadQueueEntry) -> Option<String> {
        if entry.source_path.is_none() {
            return Some(format!("no active source for {}", entry.content_hash));
        }
        (entry.size_bytes > self.limits.max_upload_size_bytes).then(|| {
            format!(
                "too large: {} bytes exceeds upload limit of {}",
                entry.size_bytes, self.limits.max_upload_size_bytes
            )
        })
    }

    async fn transfer(&self, entry: &UploadQueueEntry) -> Result<UploadOutcome> {
        let key = entry.storage_key.as_str();
        let claim = entry.claim_token();
        let Some(source) = &entry.source_path else {
            return Err(SyncError::NotFound(format!(
                "no active source for {}",
                entry.content_hash
            )));
        };

        if self.blobs.object_exists(key).await? {
            self.index.mark_content_uploaded(&entry.content_hash, claim).await?;
            info!(target: "cairn::upload", hash = %entry.content_hash, key, "blob already present");
            return Ok(UploadOutcome::AlreadyPresent);
        }

        let file = tokio::fs::File::open(source).await?;
        let hasher = Arc::new(Mutex::new(ContentHasher::new()));
        let tap = Arc::clone(&hasher);
        let body = ReaderStream::with_capacity(file, CHUNK_SIZE)
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    tap.lock().update(bytes);
                }
            })
            .boxed();

        let content_type = entry.mime_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        self.blobs
            .put_object(key, body, entry.size_bytes, content_type)
            .await?;

        let read = std::mem::take(&mut *hasher.lock()).finish();
        if read.hash != entry.content_hash || read.size_bytes != entry.size_bytes {
            let changed = SyncError::SourceChanged {
                path: source.display().to_string(),
                expected: entry.content_hash.to_string(),
                actual: read.hash.to_string(),
            };
            return Err(self.compensate(key, changed).await);
        }

        match self.index.mark_content_uploaded(&entry.content_hash, claim).await {
            Ok(()) => {}
            // The bytes are verified; the new holder adopts them.
            Err(lost @ SyncError::ClaimLost(_)) => return Err(lost),
            Err(commit) => {
                if self.committed_elsewhere(entry).await {
                    info!(target: "cairn::upload", hash = %entry.content_hash, key, error = %commit, "content committed by another worker; keeping blob");
                    return Ok(UploadOutcome::AlreadyPresent);
                }
                return Err(self.compensate(key, commit).await);
            }
        }

        info!(target: "cairn::upload", hash = %entry.content_hash, key, bytes = entry.size_bytes, "uploaded");
        Ok(UploadOutcome::Uploaded {
            bytes: entry.size_bytes,
        })
    }

    /// Whether the content is already recorded as uploaded, so the blob
    /// under its key is referenced and must stay.
    async fn committed_elsewhere(&self, entry: &UploadQueueEntry) -> bool {
        match self.index.get_content_record(&entry.content_hash).await {
            Ok(Some(record)) => record.status == UploadStatus::Uploaded,
            Ok(None) => false,
            Err(err) => {
                debug!(target: "cairn::upload", hash = %entry.content_hash, error = %err, "could not read content status before compensating");
                false
            }
        }
    }

    /// Removes a blob this worker wrote but could not stand behind.
    async fn compensate(&self, key: &str, cause: SyncError) -> SyncError {
        match self.blobs.delete_object(key).await {
            Ok(()) => {
                warn!(target: "cairn::upload", key, error = %cause, "removed uploaded blob after failure");
                SyncError::Compensated {
                    key: key.to_string(),
                    source: Box::new(cause),
                }
            }
            Err(cleanup) => SyncError::CompensationFailed {
                key: key.to_string(),
                commit: Box::new(cause),
                cleanup: Box::new(cleanup),
            },
        }
    }
}

fn claim_lost(entry: &UploadQueueEntry, detail: &str) -> UploadOutcome {
    warn!(target: "cairn::upload", hash = %entry.content_hash, %detail, "claim taken over by another worker; leaving result to it");
    UploadOutcome::ClaimLost
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use chrono::Utc;

    use super::*;
    use crate::{
        blob::InMemoryBlobStore,
        index::InMemoryMetadataIndex,
        model::{ContentHash, UploadStatus},
    };

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn uploader(
        limits: LimitsConfig,
    ) -> (Uploader, Arc<InMemoryMetadataIndex>, Arc<InMemoryBlobStore>) {
        let index = Arc::new(InMemoryMetadataIndex::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let uploader = Uploader::new(
            index.clone(),
            blobs.clone(),
            ClaimConfig::default(),
            RetryConfig::default(),
            limits,
        );
        (uploader, index, blobs)
    }

    fn entry(source: Option<PathBuf>, size_bytes: u64) -> UploadQueueEntry {
        let hash = ContentHash::parse(HELLO).unwrap();
        UploadQueueEntry {
            storage_key: format!("{hash}.txt"),
            content_hash: hash,
            size_bytes,
            source_path: source,
            mime_type: Some("text/plain".into()),
            enqueued_at: Utc::now(),
            attempts: 1,
            claim: None,
        }
    }

    async fn seed_content(index: &InMemoryMetadataIndex) {
        index
            .find_or_create_content_record(
                &ContentHash::parse(HELLO).unwrap(),
                5,
                ".txt",
                Some("text/plain"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn existing_blob_is_adopted_without_transfer() {
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;
        blobs.insert(&format!("{HELLO}.txt"), "hello");

        let outcome = uploader
            .process(&entry(Some(PathBuf::from("/nowhere")), 5))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::AlreadyPresent);
        assert_eq!(blobs.put_count(), 0);
        let content = index
            .get_content_record(&ContentHash::parse(HELLO).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.status, UploadStatus::Uploaded);
    }

    #[tokio::test]
    async fn changed_source_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"jello").unwrap();
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;

        let outcome = uploader.process(&entry(Some(path), 5)).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed { .. }));
        assert!(blobs.keys().is_empty());
        let content = index
            .get_content_record(&ContentHash::parse(HELLO).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.status, UploadStatus::Failed);
        assert!(content.last_error.unwrap().contains("changed"));
    }

    #[tokio::test]
    async fn missing_source_and_oversized_content_are_skipped() {
        let (uploader, index, blobs) = uploader(LimitsConfig {
            max_upload_size_bytes: 4,
            ..LimitsConfig::default()
        });
        seed_content(&index).await;
        let hash = ContentHash::parse(HELLO).unwrap();

        let no_source = uploader.process(&entry(None, 5)).await.unwrap();
        assert!(matches!(no_source, UploadOutcome::Skipped { reason } if reason.contains("no active source")));

        let too_big = uploader
            .process(&entry(Some(PathBuf::from("/x")), 5))
            .await
            .unwrap();
        assert!(matches!(too_big, UploadOutcome::Skipped { reason } if reason.contains("too large")));
        assert_eq!(blobs.put_count(), 0);

        let content = index.get_content_record(&hash).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Skipped);
        assert!(index.queued_hashes().is_empty());
    }

    #[tokio::test]
    async fn upload_carries_the_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;

        let outcome = uploader.process(&entry(Some(path.clone()), 5)).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Uploaded { bytes: 5 });
        assert_eq!(blobs.content_type(&format!("{HELLO}.txt")).as_deref(), Some("text/plain"));

        let mut untyped = entry(Some(path), 5);
        untyped.mime_type = None;
        blobs.delete_object(&untyped.storage_key).await.unwrap();
        uploader.process(&untyped).await.unwrap();
        assert_eq!(
            blobs.content_type(&untyped.storage_key).as_deref(),
            Some(DEFAULT_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn superseded_worker_leaves_the_blob_to_the_new_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;
        let ttl = Duration::from_secs(30);

        let mut stale = index.claim_upload_batch("a", 1, ttl).await.unwrap().remove(0);
        stale.source_path = Some(path.clone());
        index.advance_clock(ttl * 2);
        let mut current = index.claim_upload_batch("b", 1, ttl).await.unwrap().remove(0);
        current.source_path = Some(path);

        let outcome = uploader.process(&stale).await.unwrap();
        assert_eq!(outcome, UploadOutcome::ClaimLost);
        assert!(blobs.contains(&stale.storage_key));
        let content = index.get_content_record(&stale.content_hash).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Pending);

        let outcome = uploader.process(&current).await.unwrap();
        assert_eq!(outcome, UploadOutcome::AlreadyPresent);
        let content = index.get_content_record(&current.content_hash).await.unwrap().unwrap();
        assert_eq!(content.status, UploadStatus::Uploaded);
        assert!(blobs.contains(&current.storage_key));
    }

    #[tokio::test]
    async fn commit_failure_keeps_blob_once_content_is_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;
        let hash = ContentHash::parse(HELLO).unwrap();

        let mut claimed = index
            .claim_upload_batch("a", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        claimed.source_path = Some(path);
        index.mark_content_uploaded(&hash, claimed.claim_token()).await.unwrap();
        index.fail_next_mark_uploaded(1);

        let outcome = uploader.process(&claimed).await.unwrap();
        assert_eq!(outcome, UploadOutcome::AlreadyPresent);
        assert!(blobs.contains(&claimed.storage_key));
    }

    #[tokio::test]
    async fn failed_put_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let (uploader, index, blobs) = uploader(LimitsConfig::default());
        seed_content(&index).await;
        blobs.fail_next_puts(1);

        let outcome = uploader.process(&entry(Some(path), 5)).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed { .. }));
        assert!(
            index
                .claim_upload_batch("w", 10, Duration::from_secs(60))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
