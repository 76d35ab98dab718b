//! Postgres index behaviour. Needs `DATABASE_URL` and the `postgres-tests`
//! feature.
#![cfg(feature = "postgres-tests")]

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use cairn_core::{
    SyncError,
    index::{MetadataIndex, PostgresMetadataIndex},
    model::{ContentHash, FileTransition, FileUpsert, Registration, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

fn hash(byte: char) -> ContentHash {
    ContentHash::parse(&byte.to_string().repeat(64)).unwrap()
}

fn registration(path: &str, content: &ContentHash, inode: u64) -> Registration {
    let path = PathBuf::from(path);
    Registration {
        extension: ".txt".into(),
        mime_type: Some("text/plain".into()),
        file: FileUpsert {
            filename: path.file_name().unwrap().to_string_lossy().into_owned(),
            folder_path: "docs".into(),
            path,
            size_bytes: 5,
            owner_uid: 1000,
            group_gid: 1000,
            owner_name: Some("alice".into()),
            group_name: Some("users".into()),
            mode: 0o644,
            inode,
            fs_ctime: None,
            fs_mtime: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            content_hash: content.clone(),
        },
    }
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn shared_content_is_counted_once_per_path(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    let first = index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;
    let second = index.register_file(registration("/docs/b.txt", &hash('a'), 2)).await?;
    let again = index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;

    assert!(first.content_created);
    assert!(!second.content_created);
    assert_eq!(again.file.transition, FileTransition::Unchanged);

    let content = index.get_content_record(&hash('a')).await?.unwrap();
    assert_eq!(content.ref_count, 2);
    assert_eq!(content.storage_key, format!("{}.txt", hash('a')));
    assert_eq!(index.queue_depth().await?, 1);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn soft_delete_and_reactivate_reuse_the_row(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    let created = index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;

    let deleted = index.soft_delete_file_record(&PathBuf::from("/docs/a.txt")).await?;
    assert!(deleted.is_some());
    assert_eq!(index.get_content_record(&hash('a')).await?.unwrap().ref_count, 0);
    assert!(index.list_active_paths().await?.is_empty());

    let revived = index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;
    assert_eq!(revived.file.transition, FileTransition::Reactivated);
    assert_eq!(revived.file.record.id, created.file.record.id);
    assert!(revived.file.record.deleted_at.is_none());
    assert_eq!(index.get_content_record(&hash('a')).await?.unwrap().ref_count, 1);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn content_change_moves_the_reference(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;
    let changed = index.register_file(registration("/docs/a.txt", &hash('b'), 1)).await?;

    assert_eq!(
        changed.file.transition,
        FileTransition::ContentChanged { previous: hash('a') }
    );
    assert_eq!(index.get_content_record(&hash('a')).await?.unwrap().ref_count, 0);
    assert_eq!(index.get_content_record(&hash('b')).await?.unwrap().ref_count, 1);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn move_keeps_identity_and_content(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    let created = index.register_file(registration("/docs/old.txt", &hash('a'), 1)).await?;

    let moved = index
        .update_file_record_path(
            &PathBuf::from("/docs/old.txt"),
            &PathBuf::from("/docs/2026/new.txt"),
            "docs/2026",
        )
        .await?
        .unwrap();
    assert_eq!(moved.id, created.file.record.id);
    assert_eq!(moved.folder_path, "docs/2026");
    assert_eq!(moved.owner_name.as_deref(), Some("alice"));
    assert_eq!(moved.content_hash, hash('a'));
    assert_eq!(index.list_active_paths().await?, vec![PathBuf::from("/docs/2026/new.txt")]);
    assert_eq!(index.get_content_record(&hash('a')).await?.unwrap().ref_count, 1);

    let missing = index
        .update_file_record_path(&PathBuf::from("/docs/old.txt"), &PathBuf::from("/docs/x.txt"), "docs")
        .await?;
    assert!(missing.is_none());
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn concurrent_claims_are_disjoint(pool: PgPool) -> Result<()> {
    let index = Arc::new(PostgresMetadataIndex::new(pool).await?);
    for i in 0..40u64 {
        let content = ContentHash::parse(&format!("{i:064x}"))?;
        index.register_file(registration(&format!("/docs/{i}.txt"), &content, i + 1)).await?;
    }

    let mut tasks = Vec::new();
    for w in 0..6 {
        let index = index.clone();
        tasks.push(tokio::spawn(async move {
            let mut done = Vec::new();
            loop {
                let batch = index
                    .claim_upload_batch(&format!("w{w}"), 4, Duration::from_secs(60))
                    .await?;
                if batch.is_empty() {
                    return Ok::<_, cairn_core::SyncError>(done);
                }
                for entry in batch {
                    assert!(entry.source_path.is_some());
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
    assert_eq!(completed.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(index.queue_depth().await?, 0);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn failed_upload_waits_for_its_backoff(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;

    let claimed = index.claim_upload_batch("w0", 5, Duration::from_secs(60)).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempts, 1);

    index
        .mark_content_failed(
            &hash('a'),
            "boom",
            Duration::from_secs(3600),
            claimed[0].claim_token(),
        )
        .await?;
    let content = index.get_content_record(&hash('a')).await?.unwrap();
    assert_eq!(content.status, UploadStatus::Failed);
    assert_eq!(content.last_error.as_deref(), Some("boom"));
    assert!(index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await?.is_empty());

    index.mark_content_failed(&hash('a'), "boom", Duration::ZERO, None).await?;
    let retried = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await?;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempts, 2);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn expired_claims_are_released(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;

    let claimed = index.claim_upload_batch("crashed", 5, Duration::from_secs(1)).await?;
    assert_eq!(claimed.len(), 1);
    assert!(index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(index.release_expired_claims().await?, 1);
    let reclaimed = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await?;
    assert_eq!(reclaimed.len(), 1);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn superseded_claim_cannot_record_results(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;

    let stale = index.claim_upload_batch("w0", 5, Duration::from_secs(1)).await?;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let current = index.claim_upload_batch("w1", 5, Duration::from_secs(60)).await?;
    assert_eq!(current.len(), 1);

    let lost = index
        .mark_content_uploaded(&hash('a'), stale[0].claim_token())
        .await
        .unwrap_err();
    assert!(matches!(lost, SyncError::ClaimLost(_)));
    let lost = index
        .mark_content_failed(&hash('a'), "late", Duration::ZERO, stale[0].claim_token())
        .await
        .unwrap_err();
    assert!(matches!(lost, SyncError::ClaimLost(_)));
    assert_eq!(
        index.get_content_record(&hash('a')).await?.unwrap().status,
        UploadStatus::Pending
    );

    index
        .mark_content_uploaded(&hash('a'), current[0].claim_token())
        .await?;
    assert_eq!(index.queue_depth().await?, 0);
    Ok(())
}

#[sqlx::test(migrator = "cairn_core::MIGRATOR")]
async fn skipped_content_is_requeued_by_a_new_path(pool: PgPool) -> Result<()> {
    let index = PostgresMetadataIndex::new(pool).await?;
    index.register_file(registration("/docs/a.txt", &hash('a'), 1)).await?;
    let claimed = index.claim_upload_batch("w0", 5, Duration::from_secs(60)).await?;
    assert_eq!(claimed[0].mime_type.as_deref(), Some("text/plain"));

    index
        .mark_content_skipped(&hash('a'), "too large", claimed[0].claim_token())
        .await?;
    let content = index.get_content_record(&hash('a')).await?.unwrap();
    assert_eq!(content.status, UploadStatus::Skipped);
    assert_eq!(content.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(index.queue_depth().await?, 0);

    index.register_file(registration("/docs/b.txt", &hash('a'), 2)).await?;
    assert_eq!(index.queue_depth().await?, 1);
    let requeued = index.claim_upload_batch("w0", 5, Duration::from_secs(60)).await?;
    assert_eq!(requeued.len(), 1);
    assert_eq!(
        index.get_content_record(&hash('a')).await?.unwrap().status,
        UploadStatus::Pending
    );
    Ok(())
}
