use std::sync::Arc;

use tracing::info;

use crate::{
    blob::BlobStore,
    config::SyncConfig,
    debounce::DebounceQueue,
    error::Result,
    index::MetadataIndex,
    registration::RegistrationPipeline,
    scanner::{ReconcileScanner, ScanStats},
    upload::{BatchStats, Uploader},
    watcher::PollingWatcher,
};

/// Engine components wired against one index and one blob store.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    index: Arc<dyn MetadataIndex>,
    pipeline: RegistrationPipeline,
    scanner: ReconcileScanner,
    uploader: Uploader,
    queue: Arc<DebounceQueue>,
}

impl SyncEngine {
    /// Fails when the ignore patterns do not compile.
    pub fn new(
        config: SyncConfig,
        index: Arc<dyn MetadataIndex>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let filter = Arc::new(config.change_filter()?);
        let pipeline = RegistrationPipeline::new(
            Arc::clone(&index),
            config.roots.clone(),
            filter,
            config.limits,
        );
        let scanner = ReconcileScanner::new(pipeline.clone(), config.workers);
        let uploader = Uploader::new(
            Arc::clone(&index),
            blobs,
            config.claims,
            config.retry,
            config.limits,
        );
        let queue = Arc::new(DebounceQueue::new(config.watch.debounce()));

        Ok(Self {
            config: Arc::new(config),
            index,
            pipeline,
            scanner,
            uploader,
            queue,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    pub fn pipeline(&self) -> &RegistrationPipeline {
        &self.pipeline
    }

    pub fn scanner(&self) -> &ReconcileScanner {
        &self.scanner
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn queue(&self) -> &Arc<DebounceQueue> {
        &self.queue
    }

    pub fn watcher(&self) -> PollingWatcher {
        PollingWatcher::new(
            self.pipeline.roots().to_vec(),
            Arc::clone(self.pipeline.filter()),
            Arc::clone(&self.queue),
            self.config.watch.poll_interval(),
        )
    }

    /// One reconciliation pass, waiting for any running pass first.
    pub async fn scan(&self) -> Result<ScanStats> {
        self.scanner.scan().await
    }

    /// Reconciles, then uploads everything claimable. Used for one-shot runs.
    pub async fn sync_once(&self, owner: &str) -> Result<(ScanStats, BatchStats)> {
        let released = self.index.release_expired_claims().await?;
        if released > 0 {
            info!(released, "released expired upload claims");
        }
        let scan = self.scan().await?;
        let uploads = self.uploader.drain(owner).await?;
        info!(
            target: "cairn::upload",
            claimed = uploads.claimed,
            uploaded = uploads.uploaded,
            already_present = uploads.already_present,
            failed = uploads.failed,
            skipped = uploads.skipped,
            claim_lost = uploads.claim_lost,
            bytes = uploads.bytes,
            "upload queue drained"
        );
        Ok((scan, uploads))
    }
}
