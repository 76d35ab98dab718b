//! Stat-polling change detection.
//!
//! Each tick walks every root, builds a fingerprint per eligible path and
//! diffs it against the previous tick. Kernel notifications are not used:
//! NAS shares and virtualized mounts do not deliver them reliably.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::{
    debounce::DebounceQueue,
    error::{Result, SyncError},
    filter::ChangeFilter,
    model::{FileStat, WatchEvent, WatchEventKind},
    registration::root_for,
};

/// What the watcher remembers about a path between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size_bytes: u64,
    pub mtime: DateTime<Utc>,
    pub ctime: Option<DateTime<Utc>>,
    pub inode: u64,
}

impl From<&FileStat> for Fingerprint {
    fn from(stat: &FileStat) -> Self {
        Self {
            size_bytes: stat.size_bytes,
            mtime: stat.mtime,
            ctime: stat.ctime,
            inode: stat.inode,
        }
    }
}

pub type Snapshot = HashMap<PathBuf, Fingerprint>;

/// One walk of the roots.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub files: Snapshot,
    /// Roots, directories and entries the walk could not read. What lies
    /// under them is unknown, not gone.
    pub unreadable: Vec<PathBuf>,
}

impl TreeSnapshot {
    /// Whether `path` sits at or under an unreadable entry.
    pub fn is_unknown(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Fills unknown paths from `previous` so they do not read as deletions.
    pub fn carry_forward(mut self, previous: &Snapshot) -> Snapshot {
        if !self.unreadable.is_empty() {
            for (path, print) in previous {
                if !self.files.contains_key(path) && self.is_unknown(path) {
                    self.files.insert(path.clone(), *print);
                }
            }
        }
        self.files
    }
}

/// Walks `roots` and fingerprints every eligible file. Ignored directories
/// are pruned. A root that is missing or not a directory, and any entry
/// that fails with something other than not-found, lands in `unreadable`.
pub fn snapshot(roots: &[PathBuf], filter: &ChangeFilter) -> TreeSnapshot {
    let mut tree = TreeSnapshot::default();
    for root in roots {
        match std::fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!(root = %root.display(), "root is not a directory; leaving its records alone");
                tree.unreadable.push(root.clone());
                continue;
            }
            Err(err) => {
                warn!(root = %root.display(), error = %err, "root unavailable; leaving its records alone");
                tree.unreadable.push(root.clone());
                continue;
            }
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| !filter.is_ignored_name(name))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                        continue;
                    }
                    let path = err.path().unwrap_or(root.as_path()).to_path_buf();
                    warn!(path = %path.display(), error = %err, "unreadable entry during walk");
                    tree.unreadable.push(path);
                    continue;
                }
            };
            if entry.file_type().is_dir() || !filter.is_eligible(root, entry.path()) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    let stat = FileStat::from_metadata(&meta);
                    tree.files.insert(entry.into_path(), Fingerprint::from(&stat));
                }
                Err(err) => {
                    if err.io_error().map(io::Error::kind) != Some(io::ErrorKind::NotFound) {
                        debug!(path = %entry.path().display(), error = %err, "stat failed during walk");
                        tree.unreadable.push(entry.into_path());
                    }
                }
            }
        }
    }
    tree
}

/// Events that turn `previous` into `current`.
///
/// A path that appeared with the same inode and size as a path that vanished
/// under the same root is reported as a move. Inode 0 means the platform
/// does not expose one, so those fall back to delete plus create.
pub fn diff(roots: &[PathBuf], previous: &Snapshot, current: &Snapshot) -> Vec<WatchEvent> {
    let mut vanished: HashMap<(u64, u64), Vec<&Path>> = HashMap::new();
    for (path, print) in previous {
        if !current.contains_key(path) {
            vanished
                .entry((print.inode, print.size_bytes))
                .or_default()
                .push(path.as_path());
        }
    }

    let mut events = Vec::new();
    for (path, print) in current {
        match previous.get(path) {
            Some(old) if old == print => {}
            Some(_) => events.push(WatchEvent::new(path.clone(), WatchEventKind::Modified)),
            None => {
                let mut origin = None;
                if print.inode != 0
                    && let Some(candidates) = vanished.get_mut(&(print.inode, print.size_bytes))
                {
                    let root = root_for(roots, path);
                    if let Some(pos) = candidates.iter().position(|from| root_for(roots, from) == root) {
                        origin = Some(candidates.swap_remove(pos).to_path_buf());
                    }
                }
                let kind = match origin {
                    Some(from) => WatchEventKind::MovedTo { from },
                    None => WatchEventKind::Created,
                };
                events.push(WatchEvent::new(path.clone(), kind));
            }
        }
    }

    for path in vanished.into_values().flatten() {
        events.push(WatchEvent::new(path.to_path_buf(), WatchEventKind::Deleted));
    }
    events
}

/// Polls the configured roots and feeds the debounce queue.
#[derive(Debug, Clone)]
pub struct PollingWatcher {
    roots: Arc<[PathBuf]>,
    filter: Arc<ChangeFilter>,
    queue: Arc<DebounceQueue>,
    poll_interval: Duration,
}

impl PollingWatcher {
    pub fn new(
        roots: impl Into<Arc<[PathBuf]>>,
        filter: Arc<ChangeFilter>,
        queue: Arc<DebounceQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            roots: roots.into(),
            filter,
            queue,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    async fn take_snapshot(&self) -> Result<TreeSnapshot> {
        let roots = Arc::clone(&self.roots);
        let filter = Arc::clone(&self.filter);
        tokio::task::spawn_blocking(move || snapshot(&roots, &filter))
            .await
            .map_err(|e| SyncError::Internal(format!("watch poll task failed: {e}")))
    }

    /// Polls until `shutdown` fires, then closes the debounce queue so every
    /// pending path is dispatched immediately.
    ///
    /// The first snapshot is taken silently: existing files are the
    /// scanner's responsibility.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let result = self.poll_until_cancelled(&shutdown).await;
        self.queue.close();
        info!(pending = self.queue.pending_len(), "watcher stopped; flushing debounce queue");
        result
    }

    async fn poll_until_cancelled(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut previous = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            snap = self.take_snapshot() => snap?.files,
        };
        info!(roots = self.roots.len(), files = previous.len(), "watcher started");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let current = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                snap = self.take_snapshot() => match snap {
                    Ok(snap) => snap.carry_forward(&previous),
                    Err(err) => {
                        warn!(error = %err, "watch poll failed");
                        continue;
                    }
                },
            };

            let events = diff(&self.roots, &previous, &current);
            if !events.is_empty() {
                trace!(events = events.len(), "watch poll observed changes");
            }
            for event in events {
                self.queue.push(event);
            }
            previous = current;
        }
    }
}
