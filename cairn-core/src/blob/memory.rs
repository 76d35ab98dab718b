use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;

use super::{BlobStore, ByteStream, validate_key};
use crate::error::{Result, SyncError};

fn take_injected(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Blob store kept in memory, with counters and failure injection.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    content_types: Mutex<HashMap<String, String>>,
    puts: AtomicUsize,
    fail_puts: AtomicU32,
    fail_deletes: AtomicU32,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `put_object` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.fail_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.fail_deletes.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    /// Content type sent with the last successful put of `key`.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.content_types.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Seeds an object without counting it as an upload.
    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        self.objects.lock().insert(key.to_string(), bytes.into());
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put_object(
        &self,
        key: &str,
        mut body: ByteStream,
        content_length: u64,
        content_type: &str,
    ) -> Result<()> {
        validate_key(key)?;
        let mut buf = BytesMut::with_capacity(content_length as usize);
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        if take_injected(&self.fail_puts) {
            return Err(SyncError::Blob(format!("injected put failure for {key}")));
        }
        if buf.len() as u64 != content_length {
            return Err(SyncError::Blob(format!(
                "short write: expected {content_length} bytes, got {}",
                buf.len()
            )));
        }
        self.objects.lock().insert(key.to_string(), buf.freeze());
        self.content_types
            .lock()
            .insert(key.to_string(), content_type.to_string());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        if take_injected(&self.fail_deletes) {
            return Err(SyncError::Blob(format!("injected delete failure for {key}")));
        }
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.contains(key))
    }
}
