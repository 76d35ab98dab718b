//! Streaming SHA-256 over bounded chunks.

use std::{io, path::Path};

use sha2::{Digest, Sha256};

use crate::{
    error::{Result, SyncError},
    model::ContentHash,
};

/// Read size used for hashing and upload streaming.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Anything that can hand out the next chunk of bytes. `Ok(0)` means EOF.
pub trait ChunkSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: io::Read> ChunkSource for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedContent {
    pub hash: ContentHash,
    pub size_bytes: u64,
}

/// Incremental hasher shared by the registration and upload paths.
#[derive(Clone, Default)]
pub struct ContentHasher {
    digest: Sha256,
    size_bytes: u64,
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHasher")
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.size_bytes += bytes.len() as u64;
    }

    pub fn finish(self) -> HashedContent {
        HashedContent {
            hash: ContentHash::from_digest(&self.digest.finalize()),
            size_bytes: self.size_bytes,
        }
    }
}

pub fn hash_source<S: ChunkSource + ?Sized>(source: &mut S) -> Result<HashedContent> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = source.read_chunk(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Hashes a file on the blocking pool so async callers never stall on disk.
pub async fn hash_file(path: &Path) -> Result<HashedContent> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        hash_source(&mut file)
    })
    .await
    .map_err(|e| SyncError::Internal(format!("hash task failed: {e}")))?
}
