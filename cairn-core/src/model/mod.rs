//! Records shared between the engine, the metadata index and the blob store.

mod events;
mod hash;
mod records;

pub use events::{WatchEvent, WatchEventKind};
pub use hash::ContentHash;
pub use records::{
    ActiveFile, ClaimToken, ContentRecord, FileRecord, FileStat,
    FileTransition, FileUpsert, Registration, RegistrationResult,
    UploadClaim, UploadQueueEntry, UploadStatus, UpsertOutcome,
    storage_key,
};
