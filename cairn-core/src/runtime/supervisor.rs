use std::{fmt, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    SyncEngine,
    scheduler::{run_housekeeper, run_scheduler},
    worker::Worker,
};
use crate::error::Result;

const WATCHER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns every long-lived task of a running daemon.
///
/// Shutdown order: cancel the root token, wait for the watcher to close the
/// debounce queue, then give workers `shutdown_timeout` to drain flushed
/// dispatches and finish their current upload batch.
pub struct SyncRuntime {
    engine: SyncEngine,
    shutdown_token: CancellationToken,
    watcher: Option<JoinHandle<Result<()>>>,
    background: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("roots", &self.engine.config().roots)
            .field("watcher_running", &self.watcher.is_some())
            .field("background_tasks", &self.background.len())
            .field("worker_count", &self.workers.len())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl SyncRuntime {
    /// Releases claims left by a previous process, then spawns the watcher,
    /// the scheduler, the housekeeper and the worker pool.
    pub async fn start(engine: SyncEngine) -> Result<Self> {
        let config = engine.config().clone();
        let released = engine.index().release_expired_claims().await?;
        if released > 0 {
            info!(released, "released upload claims left by a previous run");
        }

        let shutdown_token = CancellationToken::new();

        let watcher = if config.watch.enabled {
            let watcher = engine.watcher();
            Some(tokio::spawn(watcher.run(shutdown_token.child_token())))
        } else {
            info!("watcher disabled; relying on scheduled reconciliation");
            engine.queue().close();
            None
        };

        let background = vec![
            tokio::spawn(run_scheduler(
                engine.scanner().clone(),
                config.schedule,
                shutdown_token.child_token(),
                config.shutdown_timeout(),
            )),
            tokio::spawn(run_housekeeper(
                Arc::clone(engine.index()),
                config.claims.housekeeper_interval(),
                shutdown_token.child_token(),
            )),
        ];

        let worker_group = format!("sync-{}", std::process::id());
        let workers = (0..config.workers.max(1))
            .map(|i| {
                let worker_id = format!("{worker_group}-w{i}");
                let worker = Worker::new(worker_id, engine.clone(), shutdown_token.child_token());
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(
            roots = config.roots.len(),
            workers = workers.len(),
            watcher = config.watch.enabled,
            "sync runtime started"
        );

        Ok(Self {
            engine,
            shutdown_token,
            watcher,
            background,
            workers,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Token that stops the runtime when cancelled. Callers still need
    /// [`SyncRuntime::shutdown`] to wait for the tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("Initiating graceful shutdown of sync runtime");
        self.shutdown_token.cancel();

        if let Some(watcher) = self.watcher {
            match tokio::time::timeout(WATCHER_FLUSH_TIMEOUT, watcher).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Watcher stopped with error: {e}"),
                Ok(Err(e)) => warn!("Watcher task failed: {:?}", e),
                Err(_) => warn!("Watcher did not stop in time"),
            }
        }
        // Flush regardless of how the watcher ended.
        self.engine.queue().close();

        let timeout = self.engine.config().shutdown_timeout();
        for handle in self.workers {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }
        for handle in self.background {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {:?}", e),
                Err(_) => warn!("Background task timed out during shutdown"),
            }
        }

        let unfinished = self.engine.queue().pending_len();
        if unfinished > 0 {
            warn!(unfinished, "paths left undispatched; the next scan will pick them up");
        }
        info!("Sync runtime shutdown complete");
        Ok(())
    }
}
