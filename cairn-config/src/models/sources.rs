use std::{path::PathBuf, time::Duration};

use cairn_core::config::SyncConfig;
use serde::Deserialize;

use super::BlobStoreConfig;
use crate::{
    loader::ConfigLoadError,
    util::{parse_bool, parse_csv, parse_duration},
};

/// Shape of `cairn.toml`. Every section is optional; `[sync]` keeps the
/// engine defaults for anything it leaves out.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database: FileDatabaseConfig,
    pub blob: Option<BlobStoreConfig>,
    pub sync: Option<SyncConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDatabaseConfig {
    pub url: Option<String>,
    pub url_file: Option<PathBuf>,
    pub max_connections: Option<u32>,
}

/// Values read from the process environment. `None` means unset.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_max_connections: Option<u32>,
    pub source_paths: Option<Vec<PathBuf>>,
    pub ignore_patterns: Option<Vec<String>>,
    pub include_hidden: Option<bool>,
    pub debounce: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub watch_enabled: Option<bool>,
    pub workers: Option<usize>,
    pub claim_batch_size: Option<usize>,
    pub claim_ttl: Option<Duration>,
    pub full_scan_hour: Option<u32>,
    pub full_scan_on_startup: Option<bool>,
    pub max_file_size_bytes: Option<u64>,
    pub blob_root: Option<PathBuf>,
    pub blob_endpoint: Option<String>,
    pub blob_bucket: Option<String>,
    pub blob_token: Option<String>,
    pub blob_token_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the overlay from any key lookup. Blank values count as unset;
    /// values that fail to parse are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        Ok(Self {
            config_path: env.string("CAIRN_CONFIG_PATH").map(PathBuf::from),
            database_url: env.string("DATABASE_URL"),
            database_url_file: env.string("DATABASE_URL_FILE").map(PathBuf::from),
            database_max_connections: env.parsed("DATABASE_MAX_CONNECTIONS")?,
            source_paths: env
                .string("SYNC_SOURCE_PATHS")
                .and_then(|raw| parse_csv(&raw))
                .map(|paths| paths.into_iter().map(PathBuf::from).collect()),
            ignore_patterns: env
                .string("SYNC_IGNORE_PATTERNS")
                .and_then(|raw| parse_csv(&raw)),
            include_hidden: env.flag("SYNC_INCLUDE_HIDDEN")?,
            debounce: match env.duration("DEBOUNCE_MS")? {
                Some(value) => Some(value),
                None => env.duration("DEBOUNCE")?,
            },
            poll_interval: env.duration("POLL_INTERVAL")?,
            watch_enabled: env.flag("WATCH_ENABLED")?,
            workers: env.parsed("SYNC_WORKERS")?,
            claim_batch_size: env.parsed("CLAIM_BATCH_SIZE")?,
            claim_ttl: env.duration("CLAIM_TTL")?,
            full_scan_hour: env.parsed("FULL_SCAN_HOUR")?,
            full_scan_on_startup: env.flag("FULL_SCAN_ON_STARTUP")?,
            max_file_size_bytes: env.parsed("MAX_FILE_SIZE_BYTES")?,
            blob_root: env.string("BLOB_ROOT").map(PathBuf::from),
            blob_endpoint: env.string("BLOB_ENDPOINT"),
            blob_bucket: env.string("BLOB_BUCKET"),
            blob_token: env.string("BLOB_TOKEN"),
            blob_token_file: env.string("BLOB_TOKEN_FILE").map(PathBuf::from),
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigLoadError> {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| invalid(key, &raw, "a non-negative integer"))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigLoadError> {
        self.string(key)
            .map(|raw| parse_bool(&raw).ok_or_else(|| invalid(key, &raw, "a boolean")))
            .transpose()
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigLoadError> {
        self.string(key)
            .map(|raw| {
                parse_duration(&raw)
                    .ok_or_else(|| invalid(key, &raw, "milliseconds or a duration like `3s`"))
            })
            .transpose()
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigLoadError {
    ConfigLoadError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Result<EnvConfig, ConfigLoadError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn reads_lists_durations_and_flags() {
        let parsed = env(&[
            ("SYNC_SOURCE_PATHS", "/volume1/docs, /volume1/photos"),
            ("SYNC_IGNORE_PATTERNS", "*.iso"),
            ("DEBOUNCE_MS", "1500"),
            ("POLL_INTERVAL", "250ms"),
            ("SYNC_WORKERS", "3"),
            ("FULL_SCAN_ON_STARTUP", "no"),
            ("BLOB_BUCKET", "  "),
        ])
        .unwrap();

        assert_eq!(
            parsed.source_paths,
            Some(vec![
                PathBuf::from("/volume1/docs"),
                PathBuf::from("/volume1/photos")
            ])
        );
        assert_eq!(parsed.ignore_patterns, Some(vec!["*.iso".to_string()]));
        assert_eq!(parsed.debounce, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(parsed.workers, Some(3));
        assert_eq!(parsed.full_scan_on_startup, Some(false));
        assert_eq!(parsed.blob_bucket, None);
    }

    #[test]
    fn humantime_debounce_is_a_fallback() {
        let parsed = env(&[("DEBOUNCE", "5s")]).unwrap();
        assert_eq!(parsed.debounce, Some(Duration::from_secs(5)));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = env(&[("SYNC_WORKERS", "many")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidEnv { ref key, .. } if key == "SYNC_WORKERS"
        ));
        assert!(env(&[("FULL_SCAN_ON_STARTUP", "perhaps")]).is_err());
        assert!(env(&[("DEBOUNCE_MS", "soon")]).is_err());
    }
}
