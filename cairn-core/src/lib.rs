//! # Cairn Core
//!
//! Sync engine for the Cairn daemon: mirrors local source trees into a
//! content-addressable blob store and keeps a relational metadata index
//! consistent with both.
//!
//! ## Overview
//!
//! - **Change detection**: a stat-polling [`watcher`] feeds a per-path
//!   [`debounce`] queue; a [`scanner`] reconciles full trees on a schedule
//! - **Registration**: [`registration`] turns one changed path into a
//!   deduplicated content record plus a file record, atomically
//! - **Upload**: [`upload`] claims queue entries, streams them into a
//!   [`blob::BlobStore`] and compensates when the index commit fails
//! - **Persistence**: [`index::MetadataIndex`] with Postgres and in-memory
//!   adapters
//! - **Runtime**: [`runtime::SyncRuntime`] supervises the long-lived tasks
//!
//! ## Feature Flags
//!
//! - `postgres` (default): the `sqlx` backed index and [`MIGRATOR`]
//! - `postgres-tests`: compiles the integration tests that need a database
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cairn_core::{
//!     blob::InMemoryBlobStore, config::SyncConfig, index::InMemoryMetadataIndex,
//!     runtime::SyncEngine,
//! };
//!
//! async fn mirror_once() -> cairn_core::Result<()> {
//!     let config = SyncConfig {
//!         roots: vec!["/volume1/docs".into()],
//!         ..SyncConfig::default()
//!     };
//!     let engine = SyncEngine::new(
//!         config,
//!         Arc::new(InMemoryMetadataIndex::new()),
//!         Arc::new(InMemoryBlobStore::new()),
//!     )?;
//!     let (scan, uploads) = engine.sync_once("example").await?;
//!     println!("{} files seen, {} uploaded", scan.total, uploads.uploaded);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Blob store port with filesystem, HTTP and in-memory adapters
pub mod blob;
/// Engine tuning
pub mod config;
pub mod debounce;
pub mod error;
pub mod filter;
pub mod hasher;
/// Metadata index port and adapters
pub mod index;
/// Records, events and identifiers shared across the engine
pub mod model;
pub mod owners;
pub mod registration;
pub mod runtime;
pub mod scanner;
pub mod upload;
pub mod watcher;

pub use error::{Result, SyncError};

/// Schema migrations for the Postgres index.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
