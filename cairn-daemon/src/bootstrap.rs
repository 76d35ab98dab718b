use std::sync::Arc;

use anyhow::Context;
use cairn_config::{BlobStoreConfig, Config, ConfigLoad, ConfigLoader, ConfigWarnings};
use cairn_core::{
    blob::{BlobStore, FilesystemBlobStore, HttpBlobStore},
    index::PostgresMetadataIndex,
    runtime::SyncEngine,
};
use tracing::{info, warn};

/// Validated configuration wired into an engine.
#[derive(Debug)]
pub struct Bootstrap {
    pub engine: SyncEngine,
}

impl Bootstrap {
    /// Loads and validates configuration, migrates the index and builds the
    /// engine. Any failure here is fatal before a task is spawned.
    pub async fn prepare(loader: &ConfigLoader) -> anyhow::Result<Self> {
        let ConfigLoad { config, warnings } =
            loader.load().context("failed to load configuration")?;

        if config.metadata.env_file_loaded {
            info!("loaded .env file");
        }
        if let Some(path) = &config.metadata.config_path {
            info!(path = %path.display(), "configuration file in effect");
        }
        log_warnings(&warnings);

        let sync = &config.sync;
        info!(
            sync.roots = sync.roots.len(),
            sync.workers = sync.workers,
            sync.debounce_ms = sync.watch.debounce_ms,
            sync.poll_interval_ms = sync.watch.poll_interval_ms,
            sync.daily_scan_hour = sync.schedule.daily_scan_hour,
            "sync configuration in effect"
        );

        let index = connect_index(&config).await?;
        index.migrate().await.context("database migration failed")?;
        let blobs = build_blob_store(&config).await?;

        let engine = SyncEngine::new(config.sync.clone(), Arc::new(index), blobs)
            .context("failed to build sync engine")?;
        Ok(Self { engine })
    }
}

pub async fn connect_index(config: &Config) -> anyhow::Result<PostgresMetadataIndex> {
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL is not configured")?;
    let pool_size = config.database.pool_size(config.sync.workers);
    PostgresMetadataIndex::connect(url, pool_size)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn build_blob_store(config: &Config) -> anyhow::Result<Arc<dyn BlobStore>> {
    let blob = config
        .blob
        .as_ref()
        .context("blob store is not configured")?;
    let store: Arc<dyn BlobStore> = match blob {
        BlobStoreConfig::Filesystem { root } => {
            info!(blob.kind = "filesystem", blob.root = %root.display(), "blob store ready");
            Arc::new(
                FilesystemBlobStore::new(root.clone())
                    .await
                    .context("failed to prepare blob root")?,
            )
        }
        BlobStoreConfig::Http {
            endpoint,
            bucket,
            token,
        } => {
            info!(blob.kind = "http", blob.endpoint = %endpoint, blob.bucket = %bucket, "blob store ready");
            Arc::new(
                HttpBlobStore::new(endpoint.clone(), bucket.clone(), token.clone())
                    .context("failed to build blob client")?,
            )
        }
    };
    Ok(store)
}

pub fn log_warnings(warnings: &ConfigWarnings) {
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
}
