use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SyncEngine;
use crate::debounce::Dispatch;

/// One pool worker. Registration dispatches take priority over uploads; no
/// new upload batch is claimed once shutdown starts, but dispatches flushed
/// by the watcher are still drained.
pub(super) struct Worker {
    id: String,
    engine: SyncEngine,
    shutdown: CancellationToken,
    idle_backoff: Duration,
}

impl Worker {
    pub(super) fn new(id: String, engine: SyncEngine, shutdown: CancellationToken) -> Self {
        let idle_backoff = engine.config().idle_backoff();
        Self {
            id,
            engine,
            shutdown,
            idle_backoff,
        }
    }

    pub(super) async fn run(self) {
        let queue = std::sync::Arc::clone(self.engine.queue());
        debug!(worker = %self.id, "worker started");

        loop {
            if let Some(dispatch) = queue.try_next_ready() {
                self.dispatch(dispatch).await;
                continue;
            }

            if self.shutdown.is_cancelled() {
                match queue.next_ready().await {
                    Some(dispatch) => {
                        self.dispatch(dispatch).await;
                        continue;
                    }
                    None => break,
                }
            }

            match self.engine.uploader().run_batch(&self.id).await {
                Ok(stats) if stats.claimed > 0 => continue,
                Ok(_) => {}
                Err(err) => warn!(worker = %self.id, error = %err, "claiming uploads failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                next = queue.next_ready() => match next {
                    Some(dispatch) => self.dispatch(dispatch).await,
                    // Watcher gone without a shutdown: keep serving uploads.
                    None => tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    },
                },
                _ = tokio::time::sleep(self.idle_backoff) => {}
            }
        }

        info!(worker = %self.id, "worker shutting down");
    }

    async fn dispatch(&self, dispatch: Dispatch) {
        let result = self.engine.pipeline().handle(&dispatch).await;
        match result {
            Ok(report) => debug!(
                target: "cairn::dispatch",
                worker = %self.id,
                path = %dispatch.path.display(),
                kind = dispatch.kind.label(),
                events = dispatch.events,
                outcome = report.outcome.label(),
                "dispatch handled"
            ),
            Err(err) if err.is_transient() => warn!(
                target: "cairn::dispatch",
                worker = %self.id,
                path = %dispatch.path.display(),
                error = %err,
                "dispatch failed; retried on the next change or scan"
            ),
            Err(err) => error!(
                target: "cairn::dispatch",
                worker = %self.id,
                path = %dispatch.path.display(),
                error = %err,
                "dispatch failed"
            ),
        }
        self.engine.queue().complete(&dispatch.path);
    }
}
