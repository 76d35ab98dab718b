use std::{fmt, fs::Metadata, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ContentHash;

/// Upload state of a [`ContentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
    /// Permanently left out, e.g. over the upload size cap. Registering a
    /// path with this content again re-queues it.
    Skipped,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
            UploadStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(UploadStatus::Pending),
            "uploaded" => Some(UploadStatus::Uploaded),
            "failed" => Some(UploadStatus::Failed),
            "skipped" => Some(UploadStatus::Skipped),
            _ => None,
        }
    }
}

/// Key a blob is stored under: the content hash followed by the extension
/// of the first path that introduced it.
pub fn storage_key(hash: &ContentHash, extension: &str) -> String {
    format!("{}{}", hash.as_str(), extension)
}

/// One row per distinct content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub hash: ContentHash,
    pub size_bytes: u64,
    /// Lowercase extension including the leading dot, or empty.
    pub extension: String,
    pub storage_key: String,
    /// Guessed from the first path that introduced the content.
    pub mime_type: Option<String>,
    pub status: UploadStatus,
    pub ref_count: i64,
    pub last_error: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContentRecord {
    pub fn new_pending(
        hash: ContentHash,
        size_bytes: u64,
        extension: &str,
        mime_type: Option<&str>,
    ) -> Self {
        Self {
            storage_key: storage_key(&hash, extension),
            hash,
            size_bytes,
            extension: extension.to_string(),
            mime_type: mime_type.map(str::to_string),
            status: UploadStatus::Pending,
            ref_count: 0,
            last_error: None,
            uploaded_at: None,
            created_at: Utc::now(),
        }
    }
}

/// One row per tracked filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub path: PathBuf,
    pub filename: String,
    pub folder_path: String,
    pub size_bytes: u64,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub owner_name: Option<String>,
    pub group_name: Option<String>,
    pub mode: u32,
    pub inode: u64,
    pub fs_ctime: Option<DateTime<Utc>>,
    pub fs_mtime: DateTime<Utc>,
    pub content_hash: ContentHash,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Projection of an active file used by the scanner to decide whether a path
/// needs to be registered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub inode: u64,
    pub fs_ctime: Option<DateTime<Utc>>,
    pub fs_mtime: DateTime<Utc>,
    pub content_hash: ContentHash,
}

impl From<&FileRecord> for ActiveFile {
    fn from(record: &FileRecord) -> Self {
        Self {
            path: record.path.clone(),
            size_bytes: record.size_bytes,
            inode: record.inode,
            fs_ctime: record.fs_ctime,
            fs_mtime: record.fs_mtime,
            content_hash: record.content_hash.clone(),
        }
    }
}

/// Timestamps are kept at microsecond precision, the resolution the index
/// stores, so a fresh stat compares equal to what was recorded.
#[cfg(unix)]
fn timestamp_micros(secs: i64, nanos: i64) -> Option<DateTime<Utc>> {
    let micros = (nanos.clamp(0, 999_999_999) / 1_000) as u32;
    DateTime::from_timestamp(secs, micros * 1_000)
}

/// Filesystem attributes captured by a single `lstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size_bytes: u64,
    pub inode: u64,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub mode: u32,
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: DateTime<Utc>,
    pub is_file: bool,
    pub is_symlink: bool,
}

impl FileStat {
    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            size_bytes: meta.len(),
            inode: meta.ino(),
            owner_uid: meta.uid(),
            group_gid: meta.gid(),
            mode: meta.mode() & 0o7777,
            ctime: timestamp_micros(meta.ctime(), meta.ctime_nsec()),
            mtime: timestamp_micros(meta.mtime(), meta.mtime_nsec())
                .unwrap_or(DateTime::UNIX_EPOCH),
            is_file: meta.file_type().is_file(),
            is_symlink: meta.file_type().is_symlink(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &Metadata) -> Self {
        let to_micros = |t: std::time::SystemTime| {
            let t = DateTime::<Utc>::from(t);
            DateTime::from_timestamp_micros(t.timestamp_micros())
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(to_micros)
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            size_bytes: meta.len(),
            inode: 0,
            owner_uid: 0,
            group_gid: 0,
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            ctime: meta.created().ok().and_then(to_micros),
            mtime,
            is_file: meta.file_type().is_file(),
            is_symlink: meta.file_type().is_symlink(),
        }
    }

    /// Size, inode, mtime and ctime agree with what the index last
    /// recorded. ctime cannot be set from userspace, so it catches an inode
    /// reused with the same size and mtime.
    pub fn matches(&self, active: &ActiveFile) -> bool {
        self.size_bytes == active.size_bytes
            && self.mtime == active.fs_mtime
            && self.ctime == active.fs_ctime
            && self.inode == active.inode
    }
}

/// Input of `upsert_file_record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpsert {
    pub path: PathBuf,
    pub filename: String,
    pub folder_path: String,
    pub size_bytes: u64,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub owner_name: Option<String>,
    pub group_name: Option<String>,
    pub mode: u32,
    pub inode: u64,
    pub fs_ctime: Option<DateTime<Utc>>,
    pub fs_mtime: DateTime<Utc>,
    pub content_hash: ContentHash,
}

impl FileUpsert {
    /// Whether any tracked attribute of `record` differs from this upsert.
    pub fn differs_from(&self, record: &FileRecord) -> bool {
        record.filename != self.filename
            || record.folder_path != self.folder_path
            || record.size_bytes != self.size_bytes
            || record.owner_uid != self.owner_uid
            || record.group_gid != self.group_gid
            || record.owner_name != self.owner_name
            || record.group_name != self.group_name
            || record.mode != self.mode
            || record.inode != self.inode
            || record.fs_ctime != self.fs_ctime
            || record.fs_mtime != self.fs_mtime
            || record.content_hash != self.content_hash
    }

    pub fn apply_to(&self, record: &mut FileRecord) {
        record.filename = self.filename.clone();
        record.folder_path = self.folder_path.clone();
        record.size_bytes = self.size_bytes;
        record.owner_uid = self.owner_uid;
        record.group_gid = self.group_gid;
        record.owner_name = self.owner_name.clone();
        record.group_name = self.group_name.clone();
        record.mode = self.mode;
        record.inode = self.inode;
        record.fs_ctime = self.fs_ctime;
        record.fs_mtime = self.fs_mtime;
        record.content_hash = self.content_hash.clone();
    }
}

/// How a file record changed as a result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransition {
    Created,
    /// A soft-deleted record came back; its reference was re-counted.
    Reactivated,
    ContentChanged { previous: ContentHash },
    MetadataChanged,
    Unchanged,
}

impl FileTransition {
    /// Whether the new content gained a reference from this upsert.
    pub fn adopts_content(&self) -> bool {
        matches!(
            self,
            FileTransition::Created
                | FileTransition::Reactivated
                | FileTransition::ContentChanged { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub record: FileRecord,
    pub transition: FileTransition,
}

/// Everything needed to register one path in a single atomic step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub file: FileUpsert,
    pub extension: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub file: UpsertOutcome,
    pub content: ContentRecord,
    pub content_created: bool,
}

/// Opaque token proving ownership of a claimed queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadClaim {
    pub token: ClaimToken,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Pending transfer of one content record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadQueueEntry {
    pub content_hash: ContentHash,
    pub storage_key: String,
    pub size_bytes: u64,
    /// An active path currently holding this content, if any.
    pub source_path: Option<PathBuf>,
    pub mime_type: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub claim: Option<UploadClaim>,
}

impl UploadQueueEntry {
    pub fn claim_token(&self) -> Option<ClaimToken> {
        self.claim.as_ref().map(|claim| claim.token)
    }
}
