pub mod sources;

use std::path::PathBuf;

use cairn_core::config::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::util::redact_url;

pub const DEFAULT_BUCKET: &str = "files";
const REDACTED: &str = "<redacted>";

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub blob: Option<BlobStoreConfig>,
    pub sync: SyncConfig,
    #[serde(skip)]
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Copy safe to print: database password and blob token are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.database.url = copy.database.url.as_deref().map(redact_url);
        if let Some(BlobStoreConfig::Http { token, .. }) = copy.blob.as_mut()
            && token.is_some()
        {
            *token = Some(REDACTED.to_string());
        }
        copy
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

impl DatabaseConfig {
    /// Pool size: explicit setting, or one connection per worker plus room
    /// for the scanner and housekeeper.
    pub fn pool_size(&self, workers: usize) -> u32 {
        self.max_connections
            .unwrap_or_else(|| u32::try_from(workers).unwrap_or(u32::MAX).saturating_add(4))
            .max(1)
    }
}

/// Where content blobs are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    Filesystem {
        root: PathBuf,
    },
    Http {
        endpoint: String,
        #[serde(default = "default_bucket")]
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl BlobStoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::Http { .. } => "http",
        }
    }
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
