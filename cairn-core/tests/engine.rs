//! End-to-end behaviour of the engine against the in-memory index and blob
//! store.

use std::{
    collections::HashSet,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use cairn_core::{
    blob::InMemoryBlobStore,
    config::SyncConfig,
    debounce::DebounceQueue,
    index::{InMemoryMetadataIndex, MetadataIndex},
    model::{ContentHash, UploadStatus, WatchEvent, WatchEventKind},
    registration::RegistrationOutcome,
    runtime::{SyncEngine, SyncRuntime},
};

const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

struct Harness {
    engine: SyncEngine,
    index: Arc<InMemoryMetadataIndex>,
    blobs: Arc<InMemoryBlobStore>,
}

fn harness(root: &Path, tweak: impl FnOnce(&mut SyncConfig)) -> Result<Harness> {
    let index = Arc::new(InMemoryMetadataIndex::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let mut config = SyncConfig {
        roots: vec![root.to_path_buf()],
        workers: 4,
        ..SyncConfig::default()
    };
    tweak(&mut config);
    let engine = SyncEngine::new(config, index.clone(), blobs.clone())?;
    Ok(Harness {
        engine,
        index,
        blobs,
    })
}

fn hello_hash() -> ContentHash {
    ContentHash::parse(HELLO).unwrap()
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn identical_files_upload_one_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), b"hello")?;
    std::fs::write(dir.path().join("b.txt"), b"hello")?;
    let h = harness(dir.path(), |_| {})?;

    let (scan, uploads) = h.engine.sync_once("test").await?;
    assert_eq!(scan.registered, 2);
    assert_eq!(uploads.uploaded, 1);

    assert_eq!(h.blobs.keys(), vec![format!("{HELLO}.txt")]);
    assert_eq!(h.blobs.put_count(), 1);
    assert_eq!(h.blobs.get(&format!("{HELLO}.txt")).unwrap().as_ref(), b"hello");

    let contents = h.index.content_records();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].ref_count, 2);
    assert_eq!(contents[0].status, UploadStatus::Uploaded);
    assert_eq!(h.index.file_records().len(), 2);

    h.engine.sync_once("test").await?;
    assert_eq!(h.blobs.put_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rapid_modifications_dispatch_once() {
    let queue = DebounceQueue::new(Duration::from_secs(3));
    for _ in 0..5 {
        queue.push(WatchEvent::new("/data/a.txt", WatchEventKind::Modified));
        tokio::time::advance(Duration::from_millis(500)).await;
    }
    assert!(queue.try_next_ready().is_none());

    let dispatch = queue.next_ready().await.unwrap();
    assert_eq!(dispatch.events, 5);
    assert_eq!(dispatch.kind, WatchEventKind::Modified);
    queue.complete(&dispatch.path);

    queue.close();
    assert!(queue.next_ready().await.is_none());
}

#[tokio::test]
async fn reappearing_path_is_reactivated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("a.txt");
    std::fs::write(&path, b"hello")?;
    let h = harness(dir.path(), |_| {})?;
    h.engine.scan().await?;

    std::fs::remove_file(&path)?;
    assert_eq!(h.engine.scan().await?.soft_deleted, 1);

    std::fs::write(&path, b"hello")?;
    let report = h.engine.pipeline().register_path(&path).await?;
    assert_eq!(report.outcome, RegistrationOutcome::Reactivated);

    let records = h.index.file_records();
    assert_eq!(records.len(), 1);
    assert!(records[0].deleted_at.is_none());
    let content = h.index.get_content_record(&hello_hash()).await?.unwrap();
    assert_eq!(content.ref_count, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() -> Result<()> {
    const ENTRIES: usize = 60;
    const WORKERS: usize = 8;

    let index = Arc::new(InMemoryMetadataIndex::new());
    for i in 0..ENTRIES {
        let hash = ContentHash::parse(&format!("{i:064x}"))?;
        index.find_or_create_content_record(&hash, 1, "", None).await?;
    }

    let mut tasks = Vec::new();
    for w in 0..WORKERS {
        let index = index.clone();
        tasks.push(tokio::spawn(async move {
            let mut done = Vec::new();
            loop {
                let batch = index
                    .claim_upload_batch(&format!("w{w}"), 3, Duration::from_secs(60))
                    .await?;
                if batch.is_empty() {
                    return Ok::<_, cairn_core::SyncError>(done);
                }
                for entry in batch {
                    tokio::task::yield_now().await;
                    index
                        .mark_content_uploaded(&entry.content_hash, entry.claim_token())
                        .await?;
                    done.push(entry.content_hash);
                }
            }
        }));
    }

    let mut completed = Vec::new();
    for task in tasks {
        completed.extend(task.await??);
    }
    let unique: HashSet<_> = completed.iter().cloned().collect();
    assert_eq!(completed.len(), ENTRIES);
    assert_eq!(unique.len(), ENTRIES);
    assert_eq!(index.queue_depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn failed_commit_removes_the_uploaded_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), b"hello")?;
    let h = harness(dir.path(), |_| {})?;
    h.engine.scan().await?;

    h.index.fail_next_mark_uploaded(1);
    let stats = h.engine.uploader().run_batch("w0").await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(h.blobs.put_count(), 1);
    assert!(!h.blobs.contains(&format!("{HELLO}.txt")));

    let content = h.index.get_content_record(&hello_hash()).await?.unwrap();
    assert_eq!(content.status, UploadStatus::Failed);
    assert!(content.last_error.unwrap().contains("rolled back"));

    h.index.advance_clock(Duration::from_secs(3600));
    let retry = h.engine.uploader().run_batch("w0").await?;
    assert_eq!(retry.uploaded, 1);
    assert!(h.blobs.contains(&format!("{HELLO}.txt")));
    Ok(())
}

#[tokio::test]
async fn moved_file_keeps_content_without_reupload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("archive"))?;
    std::fs::write(dir.path().join("report.txt"), b"hello")?;
    let h = harness(dir.path(), |_| {})?;
    h.engine.sync_once("test").await?;
    let before = h
        .index
        .get_file_record(&dir.path().join("report.txt"))
        .await?
        .unwrap();

    std::fs::rename(
        dir.path().join("report.txt"),
        dir.path().join("archive/report.txt"),
    )?;
    let (scan, uploads) = h.engine.sync_once("test").await?;
    assert_eq!(scan.moved, 1);
    assert_eq!(scan.soft_deleted, 0);
    assert_eq!(uploads.claimed, 0);

    let after = h
        .index
        .get_file_record(&dir.path().join("archive/report.txt"))
        .await?
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.content_hash, before.content_hash);
    assert!(after.folder_path.ends_with("/archive"));
    assert_eq!(h.blobs.put_count(), 1);
    Ok(())
}

#[tokio::test]
async fn deleted_file_releases_its_reference_but_keeps_the_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), b"hello")?;
    std::fs::write(dir.path().join("b.txt"), b"hello")?;
    let h = harness(dir.path(), |_| {})?;
    h.engine.sync_once("test").await?;

    std::fs::remove_file(dir.path().join("a.txt"))?;
    let scan = h.engine.scan().await?;
    assert_eq!(scan.soft_deleted, 1);

    let gone = h.index.get_file_record(&dir.path().join("a.txt")).await?.unwrap();
    assert!(gone.deleted_at.is_some());
    let content = h.index.get_content_record(&hello_hash()).await?.unwrap();
    assert_eq!(content.ref_count, 1);
    assert!(h.blobs.contains(&format!("{HELLO}.txt")));

    std::fs::remove_file(dir.path().join("b.txt"))?;
    h.engine.scan().await?;
    let content = h.index.get_content_record(&hello_hash()).await?.unwrap();
    assert_eq!(content.ref_count, 0);
    assert!(h.blobs.contains(&format!("{HELLO}.txt")));
    Ok(())
}

#[tokio::test]
async fn abandoned_claim_is_picked_up_after_expiry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), b"hello")?;
    let h = harness(dir.path(), |_| {})?;
    h.engine.scan().await?;

    let crashed = h
        .index
        .claim_upload_batch("crashed-w0", 5, Duration::from_secs(60))
        .await?;
    assert_eq!(crashed.len(), 1);
    assert_eq!(h.engine.uploader().run_batch("w1").await?.claimed, 0);

    h.index.advance_clock(Duration::from_secs(61));
    let stats = h.engine.uploader().drain("w1").await?;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.uploaded, 1);
    assert!(h.blobs.contains(&format!("{HELLO}.txt")));
    Ok(())
}

#[tokio::test]
async fn runtime_mirrors_existing_and_new_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("existing.txt"), b"hello")?;
    let h = harness(dir.path(), |c| {
        c.workers = 2;
        c.idle_backoff_ms = 20;
        c.watch.debounce_ms = 50;
        c.watch.poll_interval_ms = 20;
    })?;

    let runtime = SyncRuntime::start(h.engine.clone()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("fresh.bin"), b"fresh bytes")?;

    let blobs = h.blobs.clone();
    assert!(wait_for(|| blobs.keys().len() == 2).await);
    runtime.shutdown().await?;

    let active = h.index.list_active_paths().await?;
    assert_eq!(active.len(), 2);
    assert_eq!(h.index.queue_depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_flushes_pending_dispatches() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let h = harness(dir.path(), |c| {
        c.workers = 2;
        c.idle_backoff_ms = 20;
        c.watch.debounce_ms = 60_000;
        c.watch.poll_interval_ms = 20;
        c.schedule.scan_on_startup = false;
    })?;

    let runtime = SyncRuntime::start(h.engine.clone()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("late.txt"), b"hello")?;

    let queue = h.engine.queue().clone();
    assert!(wait_for(|| queue.pending_len() == 1).await);
    runtime.shutdown().await?;

    assert!(h.index.get_file_record(&dir.path().join("late.txt")).await?.is_some());
    assert!(h.engine.queue().is_drained());
    Ok(())
}
