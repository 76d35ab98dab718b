//! Full-tree reconciliation.
//!
//! Walks every root, compares what is on disk with the active records in the
//! index, and pushes the differences through the registration pipeline.
//! Anything the walk did not see is soft-deleted, except records that can be
//! matched to a newly appeared path, which are renamed in place.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SyncError},
    hasher::hash_file,
    model::{ActiveFile, ContentHash},
    registration::{RegistrationOutcome, RegistrationPipeline, RegistrationReport, root_for},
    watcher::{Fingerprint, Snapshot, snapshot},
};

/// Counts from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub total: usize,
    pub registered: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub moved: usize,
    pub soft_deleted: usize,
    pub skipped: usize,
    /// Roots and subtrees the walk could not read; their records were kept.
    pub unreadable: usize,
    pub errors: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ScanStats {
    fn record(&mut self, outcome: &RegistrationOutcome) {
        match outcome {
            RegistrationOutcome::Registered | RegistrationOutcome::Reactivated => {
                self.registered += 1
            }
            RegistrationOutcome::Updated => self.updated += 1,
            RegistrationOutcome::Unchanged => self.unchanged += 1,
            RegistrationOutcome::Moved { .. } => self.moved += 1,
            RegistrationOutcome::SoftDeleted | RegistrationOutcome::Retired(_) => {
                self.soft_deleted += 1
            }
            RegistrationOutcome::NotTracked | RegistrationOutcome::Skipped(_) => {
                self.skipped += 1
            }
        }
    }
}

/// Runs reconciliation passes. One pass at a time per scanner.
#[derive(Debug, Clone)]
pub struct ReconcileScanner {
    pipeline: RegistrationPipeline,
    concurrency: usize,
    running: Arc<Mutex<()>>,
}

impl ReconcileScanner {
    pub fn new(pipeline: RegistrationPipeline, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Runs one pass, or returns `None` when a pass is already running.
    pub async fn try_scan(&self) -> Result<Option<ScanStats>> {
        let Ok(_guard) = self.running.try_lock() else {
            info!(target: "cairn::scan", "reconciliation already running; skipping trigger");
            return Ok(None);
        };
        self.scan_locked().await.map(Some)
    }

    /// Runs one pass, waiting for a running pass to finish first.
    pub async fn scan(&self) -> Result<ScanStats> {
        let _guard = self.running.lock().await;
        self.scan_locked().await
    }

    async fn scan_locked(&self) -> Result<ScanStats> {
        let started = Instant::now();
        let mut stats = ScanStats::default();
        let roots: Arc<[PathBuf]> = self.pipeline.roots().into();

        let filter = Arc::clone(self.pipeline.filter());
        let walk_roots = Arc::clone(&roots);
        let tree = tokio::task::spawn_blocking(move || snapshot(&walk_roots, &filter))
            .await
            .map_err(|e| SyncError::Internal(format!("scan walk task failed: {e}")))?;
        stats.total = tree.files.len();
        stats.unreadable = tree.unreadable.len();

        let mut missing: HashMap<PathBuf, ActiveFile> = self
            .pipeline
            .index()
            .list_active_files()
            .await?
            .into_iter()
            .filter(|file| root_for(&roots, &file.path).is_some())
            .map(|file| (file.path.clone(), file))
            .collect();
        if !tree.unreadable.is_empty() {
            let before = missing.len();
            missing.retain(|path, _| tree.files.contains_key(path) || !tree.is_unknown(path));
            warn!(
                target: "cairn::scan",
                unreadable = tree.unreadable.len(),
                kept = before - missing.len(),
                "parts of the tree could not be read; their records are kept"
            );
        }
        let on_disk = tree.files;

        let mut appeared = Vec::new();
        let mut candidates = Vec::new();
        for (path, print) in &on_disk {
            match missing.remove(path) {
                Some(active) if fingerprint_matches(print, &active) => stats.unchanged += 1,
                Some(_) => candidates.push(path.clone()),
                None => appeared.push(path.clone()),
            }
        }

        let moves = self.match_moves(&roots, &on_disk, &appeared, &mut missing).await;
        let moved_to: HashSet<&PathBuf> = moves.iter().map(|(_, to)| to).collect();
        candidates.extend(appeared.iter().filter(|p| !moved_to.contains(p)).cloned());

        for (from, to) in &moves {
            match self.pipeline.move_path(from, to).await {
                Ok(report) => {
                    log_report(&report);
                    stats.record(&report.outcome);
                }
                Err(err) => {
                    warn!(target: "cairn::scan", from = %from.display(), to = %to.display(), error = %err, "move reconciliation failed");
                    stats.errors += 1;
                }
            }
        }

        let pipeline = &self.pipeline;
        let mut results = stream::iter(candidates)
            .map(|path| async move {
                let result = pipeline.register_path(&path).await;
                (path, result)
            })
            .buffer_unordered(self.concurrency);
        while let Some((path, result)) = results.next().await {
            match result {
                Ok(report) => {
                    log_report(&report);
                    stats.record(&report.outcome);
                }
                Err(err) => {
                    warn!(target: "cairn::scan", path = %path.display(), error = %err, "registration failed during scan");
                    stats.errors += 1;
                }
            }
        }

        for path in missing.into_keys() {
            match pipeline.remove_path(&path).await {
                Ok(report) => {
                    log_report(&report);
                    stats.record(&report.outcome);
                }
                Err(err) => {
                    warn!(target: "cairn::scan", path = %path.display(), error = %err, "soft delete failed during scan");
                    stats.errors += 1;
                }
            }
        }

        stats.elapsed = started.elapsed();
        info!(
            target: "cairn::scan",
            total = stats.total,
            registered = stats.registered,
            updated = stats.updated,
            unchanged = stats.unchanged,
            moved = stats.moved,
            soft_deleted = stats.soft_deleted,
            skipped = stats.skipped,
            unreadable = stats.unreadable,
            errors = stats.errors,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "reconciliation complete"
        );
        Ok(stats)
    }

    /// Pairs newly appeared paths with vanished records: inode and size
    /// first, then content hash and size. Matched records are removed from
    /// `missing`.
    async fn match_moves(
        &self,
        roots: &[PathBuf],
        on_disk: &Snapshot,
        appeared: &[PathBuf],
        missing: &mut HashMap<PathBuf, ActiveFile>,
    ) -> Vec<(PathBuf, PathBuf)> {
        let mut moves = Vec::new();
        if missing.is_empty() || appeared.is_empty() {
            return moves;
        }

        let mut unmatched = Vec::new();
        for to in appeared {
            let Some(print) = on_disk.get(to) else { continue };
            let root = root_for(roots, to);
            let from = (print.inode != 0)
                .then(|| {
                    missing
                        .values()
                        .find(|old| {
                            old.inode == print.inode
                                && old.size_bytes == print.size_bytes
                                && root_for(roots, &old.path) == root
                        })
                        .map(|old| old.path.clone())
                })
                .flatten();
            match from {
                Some(from) => {
                    missing.remove(&from);
                    moves.push((from, to.clone()));
                }
                None => unmatched.push(to),
            }
        }

        for to in unmatched {
            let Some(print) = on_disk.get(to) else { continue };
            let sized: Vec<(PathBuf, ContentHash)> = missing
                .values()
                .filter(|old| old.size_bytes == print.size_bytes)
                .map(|old| (old.path.clone(), old.content_hash.clone()))
                .collect();
            if sized.is_empty() {
                continue;
            }
            let hashed = match hash_file(to).await {
                Ok(hashed) => hashed,
                Err(err) => {
                    debug!(path = %to.display(), error = %err, "could not hash for move detection");
                    continue;
                }
            };
            if let Some((from, _)) = sized.into_iter().find(|(_, hash)| *hash == hashed.hash) {
                missing.remove(&from);
                moves.push((from, to.clone()));
            }
        }
        moves
    }
}

fn fingerprint_matches(print: &Fingerprint, active: &ActiveFile) -> bool {
    print.size_bytes == active.size_bytes
        && print.mtime == active.fs_mtime
        && print.ctime == active.fs_ctime
        && print.inode == active.inode
}

fn log_report(report: &RegistrationReport) {
    match &report.outcome {
        RegistrationOutcome::Skipped(reason) => {
            debug!(target: "cairn::scan", path = %report.path.display(), %reason, "skipped");
        }
        RegistrationOutcome::Retired(reason) => {
            info!(target: "cairn::scan", path = %report.path.display(), %reason, "retired");
        }
        outcome => {
            debug!(target: "cairn::scan", path = %report.path.display(), outcome = outcome.label(), "reconciled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LimitsConfig, filter::ChangeFilter, index::InMemoryMetadataIndex};
    use crate::index::MetadataIndex;

    fn scanner(root: &std::path::Path) -> (ReconcileScanner, Arc<InMemoryMetadataIndex>) {
        let index = Arc::new(InMemoryMetadataIndex::new());
        let pipeline = RegistrationPipeline::new(
            index.clone(),
            vec![root.to_path_buf()],
            Arc::new(ChangeFilter::with_defaults(Vec::<String>::new(), false).unwrap()),
            LimitsConfig::default(),
        );
        (ReconcileScanner::new(pipeline, 4), index)
    }

    #[tokio::test]
    async fn first_scan_registers_everything_second_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"two").unwrap();
        std::fs::write(dir.path().join("c.tmp"), b"skip").unwrap();
        let (scanner, _index) = scanner(dir.path());

        let first = scanner.scan().await.unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.registered, 2);
        assert_eq!(first.errors, 0);

        let second = scanner.scan().await.unwrap();
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.registered + second.updated + second.soft_deleted, 0);
    }

    #[tokio::test]
    async fn vanished_files_are_soft_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let (scanner, index) = scanner(dir.path());
        scanner.scan().await.unwrap();

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let stats = scanner.scan().await.unwrap();
        assert_eq!(stats.soft_deleted, 1);
        assert!(index.list_active_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renames_are_detected_as_moves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"payload").unwrap();
        let (scanner, index) = scanner(dir.path());
        scanner.scan().await.unwrap();
        let before = index.get_file_record(&dir.path().join("old.txt")).await.unwrap().unwrap();

        std::fs::rename(dir.path().join("old.txt"), dir.path().join("new.txt")).unwrap();
        let stats = scanner.scan().await.unwrap();
        assert_eq!(stats.moved, 1);
        assert_eq!(stats.soft_deleted, 0);

        let after = index.get_file_record(&dir.path().join("new.txt")).await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(index.file_records().len(), 1);
    }

    #[tokio::test]
    async fn copy_then_delete_is_matched_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"payload").unwrap();
        let (scanner, index) = scanner(dir.path());
        scanner.scan().await.unwrap();

        std::fs::copy(dir.path().join("old.txt"), dir.path().join("new.txt")).unwrap();
        std::fs::remove_file(dir.path().join("old.txt")).unwrap();
        let stats = scanner.scan().await.unwrap();
        assert_eq!(stats.moved, 1);

        let active = index.list_active_paths().await.unwrap();
        assert_eq!(active, vec![dir.path().join("new.txt")]);
        let content = index
            .get_content_record(&index.file_records()[0].content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.ref_count, 1);
    }

    #[tokio::test]
    async fn unavailable_root_keeps_its_records() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("share");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"one").unwrap();
        std::fs::write(root.join("b.txt"), b"two").unwrap();
        let (scanner, index) = scanner(&root);
        assert_eq!(scanner.scan().await.unwrap().registered, 2);

        std::fs::rename(&root, parent.path().join("share.offline")).unwrap();
        let stats = scanner.scan().await.unwrap();
        assert_eq!(stats.soft_deleted, 0);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(index.list_active_files().await.unwrap().len(), 2);

        std::fs::rename(parent.path().join("share.offline"), &root).unwrap();
        let stats = scanner.scan().await.unwrap();
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.unreadable, 0);
    }

    #[tokio::test]
    async fn newly_ignored_file_counts_as_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let index = Arc::new(InMemoryMetadataIndex::new());
        let with = |patterns: Vec<&str>| {
            ReconcileScanner::new(
                RegistrationPipeline::new(
                    index.clone(),
                    vec![dir.path().to_path_buf()],
                    Arc::new(ChangeFilter::with_defaults(patterns, false).unwrap()),
                    LimitsConfig::default(),
                ),
                2,
            )
        };
        with(vec![]).scan().await.unwrap();

        let stats = with(vec!["*.txt"]).scan().await.unwrap();
        assert_eq!(stats.soft_deleted, 1);
        assert!(index.list_active_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (scanner, _index) = scanner(dir.path());
        let guard = scanner.running.clone().try_lock_owned().unwrap();
        assert_eq!(scanner.try_scan().await.unwrap(), None);
        drop(guard);
        assert!(scanner.try_scan().await.unwrap().is_some());
    }
}
