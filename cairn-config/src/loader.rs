use std::{
    fs,
    path::{Path, PathBuf},
};

use cairn_core::config::SyncConfig;
use thiserror::Error;
use tracing::debug;

use crate::{
    models::{
        BlobStoreConfig, Config, ConfigMetadata, DEFAULT_BUCKET, DatabaseConfig,
        sources::{EnvConfig, FileConfig, FileDatabaseConfig},
    },
    util::duration_ms,
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["cairn.toml", "config/cairn.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Resolves the configuration and applies the guard rails.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let ConfigLoad {
            config,
            mut warnings,
        } = self.resolve()?;
        warnings.extend(validation::validate(&config).into_result()?);
        Ok(ConfigLoad { config, warnings })
    }

    /// Resolves `.env`, file and environment layers without validating.
    pub fn resolve(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let env = EnvConfig::gather()?;
        self.resolve_with_env(env, env_file_loaded)
    }

    /// Same as [`ConfigLoader::resolve`] with an explicit environment
    /// overlay; the process environment and `.env` are not read.
    pub fn resolve_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No cairn.toml detected; using environment variables only",
                "Pass --config or set CAIRN_CONFIG_PATH to use a configuration file",
            );
        }

        let config = compose_config(
            file_config.unwrap_or_default(),
            env,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(ConfigLoadError::EnvFile(err)),
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();
        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env.config_path {
            source.env = Some(from_env.clone());
        }
        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists());
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };
        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), ?provenance, "loaded configuration file");
        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        database: file_database,
        blob: file_blob,
        sync: file_sync,
    } = file;

    let database = DatabaseConfig {
        url: resolve_database_url(&env, &file_database)?,
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections),
    };
    let blob = resolve_blob_store(&env, file_blob)?;
    let sync = overlay_sync(file_sync.unwrap_or_default(), &env);

    Ok(Config {
        database,
        blob,
        sync,
        metadata,
    })
}

fn overlay_sync(mut sync: SyncConfig, env: &EnvConfig) -> SyncConfig {
    if let Some(paths) = &env.source_paths {
        sync.roots = paths.clone();
    }
    if let Some(patterns) = &env.ignore_patterns {
        sync.ignore_patterns = patterns.clone();
    }
    if let Some(include_hidden) = env.include_hidden {
        sync.include_hidden = include_hidden;
    }
    if let Some(debounce) = env.debounce {
        sync.watch.debounce_ms = duration_ms(debounce);
    }
    if let Some(poll) = env.poll_interval {
        sync.watch.poll_interval_ms = duration_ms(poll);
    }
    if let Some(enabled) = env.watch_enabled {
        sync.watch.enabled = enabled;
    }
    if let Some(workers) = env.workers {
        sync.workers = workers;
    }
    if let Some(batch) = env.claim_batch_size {
        sync.claims.batch_size = batch;
    }
    if let Some(ttl) = env.claim_ttl {
        sync.claims.claim_ttl_secs = ttl.as_secs();
    }
    if let Some(hour) = env.full_scan_hour {
        sync.schedule.daily_scan_hour = hour;
    }
    if let Some(on_startup) = env.full_scan_on_startup {
        sync.schedule.scan_on_startup = on_startup;
    }
    if let Some(max) = env.max_file_size_bytes {
        sync.limits.max_file_size_bytes = max;
    }
    sync
}

fn resolve_database_url(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(url) = env.database_url.clone() {
        return Ok(Some(url));
    }
    if let Some(path) = env.database_url_file.as_ref()
        && let Some(url) = read_secret_file(path)?
    {
        return Ok(Some(url));
    }
    if let Some(url) = file_database
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        return Ok(Some(url.to_string()));
    }
    match file_database.url_file.as_ref() {
        Some(path) => read_secret_file(path),
        None => Ok(None),
    }
}

/// `BLOB_ENDPOINT` selects the HTTP store, `BLOB_ROOT` the filesystem store;
/// otherwise the file's `[blob]` section applies, with bucket and token still
/// overridable from the environment.
fn resolve_blob_store(
    env: &EnvConfig,
    file_blob: Option<BlobStoreConfig>,
) -> Result<Option<BlobStoreConfig>, ConfigLoadError> {
    let env_token = match (&env.blob_token, &env.blob_token_file) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(path)) => read_secret_file(path)?,
        (None, None) => None,
    };

    if let Some(endpoint) = &env.blob_endpoint {
        let (file_bucket, file_token) = match file_blob {
            Some(BlobStoreConfig::Http { bucket, token, .. }) => (Some(bucket), token),
            _ => (None, None),
        };
        return Ok(Some(BlobStoreConfig::Http {
            endpoint: endpoint.clone(),
            bucket: env
                .blob_bucket
                .clone()
                .or(file_bucket)
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            token: env_token.or(file_token),
        }));
    }
    if let Some(root) = &env.blob_root {
        return Ok(Some(BlobStoreConfig::Filesystem { root: root.clone() }));
    }

    Ok(file_blob.map(|blob| match blob {
        BlobStoreConfig::Http {
            endpoint,
            bucket,
            token,
        } => BlobStoreConfig::Http {
            endpoint,
            bucket: env.blob_bucket.clone().unwrap_or(bucket),
            token: env_token.or(token),
        },
        other => other,
    }))
}

fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key}={value:?} is invalid; expected {expected}")]
    InvalidEnv {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load .env file")]
    EnvFile(#[source] dotenvy::Error),
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}

#[derive(Debug, Default, Clone)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            Some((path.clone(), ConfigPathProvenance::Explicit))
        } else if let Some(path) = &self.env {
            Some((path.clone(), ConfigPathProvenance::Environment))
        } else {
            self.default
                .as_ref()
                .map(|path| (path.clone(), ConfigPathProvenance::Default))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Environment,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, Self::Explicit | Self::Environment)
    }
}
