use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use super::{BlobStore, ByteStream, validate_key};
use crate::error::{Result, SyncError};

/// Blob store rooted at a local (or mounted) directory. Objects are written
/// to a temporary name and renamed into place, so readers never observe a
/// partial object.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn write_staged(
        &self,
        staging: &Path,
        mut body: ByteStream,
        content_length: u64,
    ) -> Result<()> {
        let mut file = fs::File::create(staging).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;

        if written != content_length {
            return Err(SyncError::Blob(format!(
                "short write: expected {content_length} bytes, got {written}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        content_length: u64,
        _content_type: &str,
    ) -> Result<()> {
        let target = self.object_path(key)?;
        let staging = self.root.join(format!(".{key}.{}.partial", Uuid::new_v4()));

        if let Err(err) = self.write_staged(&staging, body, content_length).await {
            drop(fs::remove_file(&staging).await);
            return Err(err);
        }
        if let Err(err) = fs::rename(&staging, &target).await {
            drop(fs::remove_file(&staging).await);
            return Err(SyncError::Blob(format!("rename into {key} failed: {err}")));
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::Blob(format!("delete {key} failed: {err}"))),
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(key)?).await?)
    }
}
