//! The one code path that turns "this path may have changed" into index
//! state. Shared by watcher dispatches and the reconciliation scanner.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    config::LimitsConfig,
    debounce::Dispatch,
    error::{Result, SyncError},
    filter::ChangeFilter,
    hasher::hash_file,
    index::MetadataIndex,
    model::{
        ActiveFile, ContentHash, FileStat, FileTransition, FileUpsert,
        Registration, WatchEventKind,
    },
    owners::OwnerNames,
};

/// Why a path was left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OutsideRoots,
    Ignored,
    NotRegularFile,
    SymlinkEscapesRoot,
    TooLarge { size_bytes: u64, limit: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OutsideRoots => f.write_str("outside configured roots"),
            SkipReason::Ignored => f.write_str("matches ignore pattern"),
            SkipReason::NotRegularFile => f.write_str("not a regular file"),
            SkipReason::SymlinkEscapesRoot => f.write_str("symlink escapes root"),
            SkipReason::TooLarge { size_bytes, limit } => {
                write!(f, "{size_bytes} bytes exceeds limit of {limit}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Updated,
    Reactivated,
    Unchanged,
    Moved { from: PathBuf },
    SoftDeleted,
    /// The path is gone and was never tracked.
    NotTracked,
    Skipped(SkipReason),
    /// A tracked path stopped qualifying and its record was soft-deleted.
    Retired(SkipReason),
}

impl RegistrationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationOutcome::Registered => "registered",
            RegistrationOutcome::Updated => "updated",
            RegistrationOutcome::Reactivated => "reactivated",
            RegistrationOutcome::Unchanged => "unchanged",
            RegistrationOutcome::Moved { .. } => "moved",
            RegistrationOutcome::SoftDeleted => "soft_deleted",
            RegistrationOutcome::NotTracked => "not_tracked",
            RegistrationOutcome::Skipped(_) => "skipped",
            RegistrationOutcome::Retired(_) => "retired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    pub path: PathBuf,
    pub outcome: RegistrationOutcome,
    pub content_hash: Option<ContentHash>,
    /// A new content record (and upload queue entry) was created.
    pub content_created: bool,
}

impl RegistrationReport {
    fn bare(path: &Path, outcome: RegistrationOutcome) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome,
            content_hash: None,
            content_created: false,
        }
    }
}

/// Root containing `path` (longest match wins for nested roots).
pub fn root_for<'a>(roots: &'a [PathBuf], path: &Path) -> Option<&'a Path> {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .map(PathBuf::as_path)
}

/// Root directory name joined with the path's parent relative to the root,
/// e.g. `/volume1/docs/a/b.txt` under `/volume1/docs` gives `docs/a`.
pub fn folder_path(root: &Path, path: &Path) -> String {
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path
        .parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    match (base.is_empty(), parent.is_empty()) {
        (_, true) => base,
        (true, false) => parent,
        (false, false) => format!("{base}/{parent}"),
    }
}

/// MIME type guessed from the file name, e.g. `text/plain` for `a.txt`.
pub fn guess_mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Lowercased extension with its dot, or empty when the extension would not
/// make a clean storage key.
pub fn storage_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 16 && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Stat, hash and register one path.
#[derive(Debug, Clone)]
pub struct RegistrationPipeline {
    index: Arc<dyn MetadataIndex>,
    roots: Arc<[PathBuf]>,
    filter: Arc<ChangeFilter>,
    limits: LimitsConfig,
    owners: Arc<OwnerNames>,
}

impl RegistrationPipeline {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        roots: Vec<PathBuf>,
        filter: Arc<ChangeFilter>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            index,
            roots: roots.into(),
            filter,
            limits,
            owners: Arc::new(OwnerNames::new()),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn filter(&self) -> &Arc<ChangeFilter> {
        &self.filter
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    /// Runs one debounced dispatch.
    pub async fn handle(&self, dispatch: &Dispatch) -> Result<RegistrationReport> {
        match &dispatch.kind {
            WatchEventKind::MovedTo { from } => self.move_path(from, &dispatch.path).await,
            _ => self.register_path(&dispatch.path).await,
        }
    }

    /// Moves the record at `from` to `to` in place, then refreshes it from
    /// disk. Falls back to plain registration when `from` was not tracked.
    pub async fn move_path(&self, from: &Path, to: &Path) -> Result<RegistrationReport> {
        if !path_exists(to).await? {
            self.register_path(from).await?;
            return self.register_path(to).await;
        }

        let Some(root) = root_for(&self.roots, to) else {
            self.register_path(from).await?;
            return self.register_path(to).await;
        };
        let folder = folder_path(root, to);
        match self.index.update_file_record_path(from, to, &folder).await? {
            Some(moved) => {
                debug!(from = %from.display(), to = %to.display(), hash = %moved.content_hash, "moved file record");
                let mut report = self.register_path(to).await?;
                if matches!(
                    report.outcome,
                    RegistrationOutcome::Updated | RegistrationOutcome::Unchanged
                ) {
                    report.outcome = RegistrationOutcome::Moved {
                        from: from.to_path_buf(),
                    };
                }
                Ok(report)
            }
            None => self.register_path(to).await,
        }
    }

    /// Stat → hash → content lookup/insert → file upsert. A vanished path is
    /// soft-deleted, and so is a tracked path that no longer qualifies. Read
    /// failures abort without touching the index.
    pub async fn register_path(&self, path: &Path) -> Result<RegistrationReport> {
        let Some(root) = root_for(&self.roots, path) else {
            return Ok(RegistrationReport::bare(
                path,
                RegistrationOutcome::Skipped(SkipReason::OutsideRoots),
            ));
        };

        let link_meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return self.remove_path(path).await;
            }
            Err(err) => return Err(err.into()),
        };

        let meta = if link_meta.file_type().is_symlink() {
            if !symlink_stays_within(root, path).await? {
                warn!(path = %path.display(), "skipping symlink that escapes its root");
                return self.skip(path, SkipReason::SymlinkEscapesRoot).await;
            }
            match tokio::fs::metadata(path).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return self.remove_path(path).await;
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            link_meta
        };

        if !meta.is_file() {
            return self.skip(path, SkipReason::NotRegularFile).await;
        }
        if !self.filter.is_eligible(root, path) {
            return self.skip(path, SkipReason::Ignored).await;
        }

        let stat = FileStat::from_metadata(&meta);
        if stat.size_bytes > self.limits.max_file_size_bytes {
            warn!(path = %path.display(), size = stat.size_bytes, "skipping oversized file");
            let reason = SkipReason::TooLarge {
                size_bytes: stat.size_bytes,
                limit: self.limits.max_file_size_bytes,
            };
            return self.skip(path, reason).await;
        }

        let content_hash = match self.reusable_hash(path, &stat).await? {
            Some(hash) => hash,
            None => self.hash_stable(path, &stat).await?,
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let registration = Registration {
            extension: storage_extension(path),
            mime_type: guess_mime_type(path),
            file: FileUpsert {
                path: path.to_path_buf(),
                filename,
                folder_path: folder_path(root, path),
                size_bytes: stat.size_bytes,
                owner_uid: stat.owner_uid,
                group_gid: stat.group_gid,
                owner_name: self.owners.user(stat.owner_uid),
                group_name: self.owners.group(stat.group_gid),
                mode: stat.mode,
                inode: stat.inode,
                fs_ctime: stat.ctime,
                fs_mtime: stat.mtime,
                content_hash: content_hash.clone(),
            },
        };

        let result = self.index.register_file(registration).await?;
        let outcome = match result.file.transition {
            FileTransition::Created => RegistrationOutcome::Registered,
            FileTransition::Reactivated => RegistrationOutcome::Reactivated,
            FileTransition::ContentChanged { .. } | FileTransition::MetadataChanged => {
                RegistrationOutcome::Updated
            }
            FileTransition::Unchanged => RegistrationOutcome::Unchanged,
        };

        Ok(RegistrationReport {
            path: path.to_path_buf(),
            outcome,
            content_hash: Some(content_hash),
            content_created: result.content_created,
        })
    }

    /// Soft-deletes the record for a path that no longer exists.
    pub async fn remove_path(&self, path: &Path) -> Result<RegistrationReport> {
        let outcome = match self.index.soft_delete_file_record(path).await? {
            Some(record) => {
                debug!(path = %path.display(), hash = %record.content_hash, "soft-deleted file record");
                RegistrationOutcome::SoftDeleted
            }
            None => RegistrationOutcome::NotTracked,
        };
        Ok(RegistrationReport::bare(path, outcome))
    }

    /// Leaves a non-qualifying path out of the index, retiring its record
    /// when one is active.
    async fn skip(&self, path: &Path, reason: SkipReason) -> Result<RegistrationReport> {
        match self.index.soft_delete_file_record(path).await? {
            Some(record) => {
                debug!(path = %path.display(), hash = %record.content_hash, %reason, "retired file record");
                Ok(RegistrationReport::bare(path, RegistrationOutcome::Retired(reason)))
            }
            None => Ok(RegistrationReport::bare(path, RegistrationOutcome::Skipped(reason))),
        }
    }

    /// When the active record still matches the stat, its hash is reused
    /// instead of reading the file again.
    async fn reusable_hash(&self, path: &Path, stat: &FileStat) -> Result<Option<ContentHash>> {
        let record = self.index.get_file_record(path).await?;
        Ok(record
            .filter(|r| r.is_active() && stat.matches(&ActiveFile::from(r)))
            .map(|r| r.content_hash))
    }

    async fn hash_stable(&self, path: &Path, before: &FileStat) -> Result<ContentHash> {
        let hashed = hash_file(path).await?;
        let after = FileStat::from_metadata(&tokio::fs::metadata(path).await?);

        if hashed.size_bytes != before.size_bytes
            || after.size_bytes != before.size_bytes
            || after.mtime != before.mtime
        {
            return Err(SyncError::Unstable(path.display().to_string()));
        }
        Ok(hashed.hash)
    }
}

async fn path_exists(path: &Path) -> Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

async fn symlink_stays_within(root: &Path, path: &Path) -> Result<bool> {
    let root = tokio::fs::canonicalize(root).await?;
    match tokio::fs::canonicalize(path).await {
        Ok(target) => Ok(target.starts_with(&root)),
        // Dangling link: nothing to register.
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
