//! Blob store port and adapters.

mod fs;
mod http;
mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::{Result, SyncError};

pub use fs::FilesystemBlobStore;
pub use http::HttpBlobStore;
pub use memory::InMemoryBlobStore;

/// Body handed to [`BlobStore::put_object`].
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait BlobStore: fmt::Debug + Send + Sync {
    /// Stores `body` under `key`, replacing any existing object.
    async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        content_length: u64,
        content_type: &str,
    ) -> Result<()>;

    /// Removes `key`. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn object_exists(&self, key: &str) -> Result<bool>;
}

/// Keys are flat names built from a hex digest and an extension.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidInput(format!("invalid blob key {key:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_must_be_flat_names() {
        assert!(validate_key("2cf24dba.txt").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key(".hidden").is_err());
    }
}
