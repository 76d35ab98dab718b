use std::path::PathBuf;

use thiserror::Error;

use crate::models::{BlobStoreConfig, Config};

/// Settings the daemon refuses to start with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("DATABASE_URL is not configured")]
    MissingDatabaseUrl,
    #[error("no source roots configured")]
    NoSourceRoots,
    #[error("source root {path} does not exist")]
    SourceRootMissing { path: PathBuf },
    #[error("source root {path} is not a directory")]
    SourceRootNotDirectory { path: PathBuf },
    #[error("blob store is not configured")]
    MissingBlobStore,
    #[error("blob root {blob_root} lies inside source root {source_root}")]
    BlobRootInsideSource {
        blob_root: PathBuf,
        source_root: PathBuf,
    },
    #[error("full scan hour {hour} is outside 0-23")]
    ScanHourOutOfRange { hour: u32 },
    #[error("at least one sync worker is required")]
    NoWorkers,
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("invalid ignore pattern: {reason}")]
    InvalidIgnorePattern { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Every problem found in one pass, so `check-config` can list them all.
#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ConfigGuardRailError>,
    pub warnings: ConfigWarnings,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fails with the first error, otherwise hands back the warnings.
    pub fn into_result(self) -> Result<ConfigWarnings, ConfigGuardRailError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.warnings),
        }
    }
}

pub fn validate(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    let errors = &mut report.errors;
    let warnings = &mut report.warnings;
    let sync = &config.sync;

    if config
        .database
        .url
        .as_deref()
        .is_none_or(|url| url.trim().is_empty())
    {
        errors.push(ConfigGuardRailError::MissingDatabaseUrl);
    }

    if sync.roots.is_empty() {
        errors.push(ConfigGuardRailError::NoSourceRoots);
    }
    for root in &sync.roots {
        match std::fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => errors.push(ConfigGuardRailError::SourceRootNotDirectory { path: root.clone() }),
            Err(_) => errors.push(ConfigGuardRailError::SourceRootMissing { path: root.clone() }),
        }
    }

    match &config.blob {
        None => errors.push(ConfigGuardRailError::MissingBlobStore),
        Some(BlobStoreConfig::Filesystem { root }) => {
            if let Some(source_root) = sync.roots.iter().find(|source| root.starts_with(source)) {
                errors.push(ConfigGuardRailError::BlobRootInsideSource {
                    blob_root: root.clone(),
                    source_root: source_root.clone(),
                });
            }
        }
        Some(BlobStoreConfig::Http { token, endpoint, .. }) => {
            if token.is_none() {
                warnings.push_with_hint(
                    format!("no BLOB_TOKEN configured for {endpoint}"),
                    "Requests are sent without an Authorization header",
                );
            }
            if endpoint.starts_with("http://") {
                warnings.push("blob endpoint uses plain http; content travels unencrypted");
            }
        }
    }

    if sync.schedule.daily_scan_hour > 23 {
        errors.push(ConfigGuardRailError::ScanHourOutOfRange {
            hour: sync.schedule.daily_scan_hour,
        });
    }
    if sync.workers == 0 {
        errors.push(ConfigGuardRailError::NoWorkers);
    }
    if sync.watch.debounce_ms == 0 {
        errors.push(ConfigGuardRailError::NonPositive { field: "debounce" });
    }
    if sync.watch.enabled && sync.watch.poll_interval_ms == 0 {
        errors.push(ConfigGuardRailError::NonPositive { field: "poll interval" });
    }
    if sync.claims.claim_ttl_secs == 0 {
        errors.push(ConfigGuardRailError::NonPositive { field: "claim TTL" });
    }
    if sync.claims.batch_size == 0 {
        errors.push(ConfigGuardRailError::NonPositive { field: "claim batch size" });
    }

    if let Err(err) = sync.change_filter() {
        errors.push(ConfigGuardRailError::InvalidIgnorePattern {
            reason: err.to_string(),
        });
    }

    if sync.watch.enabled && sync.watch.poll_interval_ms >= sync.watch.debounce_ms {
        warnings.push_with_hint(
            "poll interval is not shorter than the debounce window",
            "Bursts may dispatch more than once; lower POLL_INTERVAL or raise DEBOUNCE_MS",
        );
    }
    if !sync.watch.enabled {
        warnings.push("watcher disabled; changes are only picked up by scheduled scans");
    }
    if let Some(max) = config.database.max_connections
        && (max as usize) <= sync.workers
    {
        warnings.push_with_hint(
            format!("database pool of {max} is not larger than {} workers", sync.workers),
            "Workers will queue for connections; raise DATABASE_MAX_CONNECTIONS",
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use cairn_core::config::SyncConfig;

    use super::*;
    use crate::models::{ConfigMetadata, DatabaseConfig};

    fn config(root: PathBuf, blob_root: PathBuf) -> Config {
        Config {
            database: DatabaseConfig {
                url: Some("postgres://localhost/cairn".into()),
                max_connections: None,
            },
            blob: Some(BlobStoreConfig::Filesystem { root: blob_root }),
            sync: SyncConfig {
                roots: vec![root],
                workers: 2,
                ..SyncConfig::default()
            },
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn sound_config_passes() {
        let source = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();
        let report = validate(&config(source.path().into(), blobs.path().into()));
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn every_problem_is_reported() {
        let source = tempfile::tempdir().unwrap();
        let file = source.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut cfg = config(source.path().join("missing"), source.path().join("blobs"));
        cfg.database.url = None;
        cfg.sync.roots.push(file.clone());
        cfg.sync.schedule.daily_scan_hour = 24;
        cfg.sync.workers = 0;
        cfg.sync.claims.claim_ttl_secs = 0;
        cfg.sync.ignore_patterns = vec!["[".into()];

        let report = validate(&cfg);
        let errors = &report.errors;
        assert!(errors.contains(&ConfigGuardRailError::MissingDatabaseUrl));
        assert!(errors.contains(&ConfigGuardRailError::SourceRootMissing {
            path: source.path().join("missing")
        }));
        assert!(errors.contains(&ConfigGuardRailError::SourceRootNotDirectory { path: file }));
        assert!(errors.contains(&ConfigGuardRailError::ScanHourOutOfRange { hour: 24 }));
        assert!(errors.contains(&ConfigGuardRailError::NoWorkers));
        assert!(errors.contains(&ConfigGuardRailError::NonPositive { field: "claim TTL" }));
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ConfigGuardRailError::InvalidIgnorePattern { .. }))
        );
        assert_eq!(
            report.into_result().unwrap_err(),
            ConfigGuardRailError::MissingDatabaseUrl
        );
    }

    #[test]
    fn blob_root_inside_a_source_is_rejected() {
        let source = tempfile::tempdir().unwrap();
        let cfg = config(source.path().into(), source.path().join(".cairn-blobs"));
        assert_eq!(
            validate(&cfg).errors,
            vec![ConfigGuardRailError::BlobRootInsideSource {
                blob_root: source.path().join(".cairn-blobs"),
                source_root: source.path().into(),
            }]
        );
    }

    #[test]
    fn missing_blob_store_and_empty_roots_fail() {
        let blobs = tempfile::tempdir().unwrap();
        let mut cfg = config(PathBuf::new(), blobs.path().into());
        cfg.sync.roots.clear();
        cfg.blob = None;
        let errors = validate(&cfg).errors;
        assert!(errors.contains(&ConfigGuardRailError::NoSourceRoots));
        assert!(errors.contains(&ConfigGuardRailError::MissingBlobStore));
    }

    #[test]
    fn slow_polling_and_tokenless_http_warn() {
        let source = tempfile::tempdir().unwrap();
        let mut cfg = config(source.path().into(), PathBuf::from("/unused"));
        cfg.blob = Some(BlobStoreConfig::Http {
            endpoint: "https://blobs.example".into(),
            bucket: "files".into(),
            token: None,
        });
        cfg.sync.watch.poll_interval_ms = 5_000;
        cfg.sync.watch.debounce_ms = 3_000;

        let report = validate(&cfg);
        assert!(report.is_ok(), "{:?}", report.errors);
        let messages: Vec<_> = report.warnings.items.iter().map(|w| w.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("BLOB_TOKEN")));
        assert!(messages.iter().any(|m| m.contains("debounce window")));
    }
}
