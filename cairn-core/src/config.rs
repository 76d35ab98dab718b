//! Engine tuning. Every struct deserializes with defaults so partial TOML or
//! JSON overrides work.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Change detection tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period a path must stay untouched before it is dispatched (ms).
    pub debounce_ms: u64,
    /// Stat polling cadence (ms). Keep well under the debounce window.
    pub poll_interval_ms: u64,
    /// Disable the watcher entirely and rely on scheduled scans.
    pub enabled: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            poll_interval_ms: 1_000,
            enabled: true,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Upload queue claim tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Entries claimed per round trip.
    pub batch_size: usize,
    /// How long a claim stays exclusive before another worker may take it (s).
    pub claim_ttl_secs: u64,
    /// Cadence for releasing expired claims (ms).
    pub housekeeper_interval_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            claim_ttl_secs: 300,
            housekeeper_interval_ms: 60_000,
        }
    }
}

impl ClaimConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }
}

/// Backoff applied to failed uploads before they become claimable again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 5_000,
            backoff_max_ms: 15 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, doubling from the base and capped,
    /// with jitter derived from `key` so it is stable for a given entry.
    pub fn delay_for(&self, attempt: u32, key: &str) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let anchor = ((self.backoff_base_ms as f64) * 2f64.powi(exp))
            .min(self.backoff_max_ms as f64)
            .max(0.0);

        let span = (anchor * f64::from(self.jitter_ratio.max(0.0)))
            .max(self.jitter_min_ms as f64)
            .min(self.backoff_max_ms as f64);
        let lower = (anchor - span).max(0.0);
        let upper = (anchor + span).min(self.backoff_max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        let mut hasher = DefaultHasher::default();
        key.hash(&mut hasher);
        attempt.hash(&mut hasher);
        let unit = (hasher.finish() as f64) / (u64::MAX as f64);
        Duration::from_millis((lower + (upper - lower) * unit).round() as u64)
    }
}

/// Reconciliation scan triggers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local hour (0-23) at which the daily scan starts.
    pub daily_scan_hour: u32,
    /// Run a scan as soon as the runtime starts.
    pub scan_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_scan_hour: 3,
            scan_on_startup: true,
        }
    }
}

/// Size guards.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Files above this size are not registered.
    pub max_file_size_bytes: u64,
    /// Content above this size is registered but never transferred.
    pub max_upload_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 1024 * 1024 * 1024,
            max_upload_size_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Top-level engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Source trees to mirror.
    pub roots: Vec<PathBuf>,
    /// Extra glob patterns on top of the built-in ignore list.
    pub ignore_patterns: Vec<String>,
    /// Start from the built-in ignore list.
    pub use_default_ignores: bool,
    /// Track dot-files and dot-directories.
    pub include_hidden: bool,
    /// Concurrent workers draining dispatches and uploads.
    pub workers: usize,
    /// Worker sleep when neither dispatches nor uploads are available (ms).
    pub idle_backoff_ms: u64,
    /// Grace period for workers to finish their current unit on shutdown (s).
    pub shutdown_timeout_secs: u64,
    pub watch: WatchConfig,
    pub claims: ClaimConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
    pub limits: LimitsConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            ignore_patterns: Vec::new(),
            use_default_ignores: true,
            include_hidden: false,
            workers: Self::default_workers(),
            idle_backoff_ms: 10_000,
            shutdown_timeout_secs: 30,
            watch: WatchConfig::default(),
            claims: ClaimConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl SyncConfig {
    /// CPU count clamped to a range that keeps NAS disks from thrashing.
    pub fn default_workers() -> usize {
        num_cpus::get().clamp(2, 8)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Builds the change filter these settings describe.
    pub fn change_filter(&self) -> crate::Result<crate::filter::ChangeFilter> {
        if self.use_default_ignores {
            crate::filter::ChangeFilter::with_defaults(&self.ignore_patterns, self.include_hidden)
        } else {
            crate::filter::ChangeFilter::new(&self.ignore_patterns, self.include_hidden)
        }
    }
}
