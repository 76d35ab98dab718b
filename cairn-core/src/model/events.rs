use std::path::PathBuf;

use tokio::time::Instant;

/// Kind of change observed for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    /// The path was renamed away and the destination is not tracked.
    MovedFrom,
    /// The path is the destination of a rename from `from`.
    MovedTo { from: PathBuf },
    Deleted,
}

impl WatchEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            WatchEventKind::Created => "created",
            WatchEventKind::Modified => "modified",
            WatchEventKind::MovedFrom => "moved-from",
            WatchEventKind::MovedTo { .. } => "moved-to",
            WatchEventKind::Deleted => "deleted",
        }
    }

    /// True when the path is expected to be gone from disk.
    pub fn is_removal(&self) -> bool {
        matches!(self, WatchEventKind::Deleted | WatchEventKind::MovedFrom)
    }
}

/// A raw change observation, owned by the debounce queue until dispatch.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub observed_at: Instant,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
        }
    }
}
