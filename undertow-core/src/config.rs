//! Centralized configuration for Undertow.
//!
//! Every tunable of the session pump, the priority scheduler and on-disk
//! storage lives here rather than as constants spread through the code.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

/// Engine session and blocking-wait settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one event wait of the pump, and on how long a blocked
    /// caller goes without checking its cancellation token
    pub poll_interval: Duration,
    /// How long teardown waits for the engine to confirm removal
    pub removal_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            removal_timeout: Duration::from_secs(5),
        }
    }
}

/// Read-ahead window sizing.
///
/// Each window is the larger of a fixed floor and a per-mille share of the
/// file being read.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum margin around a requested range, in bytes
    pub margin_floor: u64,
    /// Margin as a share of the file size, in thousandths
    pub margin_per_mille: u64,
    /// Minimum look-ahead after a requested range, in bytes
    pub lookahead_floor: u64,
    /// Look-ahead as a share of the file size, in thousandths
    pub lookahead_per_mille: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            margin_floor: 256 * 1024,
            margin_per_mille: 5,
            lookahead_floor: 16 * 1024 * 1024,
            lookahead_per_mille: 50,
        }
    }
}

impl SchedulerConfig {
    /// Margin window in bytes for a file of `file_size` bytes.
    pub fn margin_for(&self, file_size: u64) -> u64 {
        self.margin_floor
            .max(file_size / 1000 * self.margin_per_mille)
    }

    /// Look-ahead window in bytes for a file of `file_size` bytes.
    pub fn lookahead_for(&self, file_size: u64) -> u64 {
        self.lookahead_floor
            .max(file_size / 1000 * self.lookahead_per_mille)
    }
}

/// Where content data and cached descriptions are stored.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Default save path for downloaded content
    pub download_dir: PathBuf,
    /// Directory for cached `.torrent` descriptions
    pub cache_dir: PathBuf,
    /// Keep downloaded data when content is closed
    pub keep_files: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("undertow");
        Self {
            download_dir: base.join("downloads"),
            cache_dir: base.join("cache"),
            keep_files: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unset or unparsable variables leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(millis) = env_parse::<u64>("UNDERTOW_POLL_INTERVAL_MS") {
            config.engine.poll_interval = Duration::from_millis(millis.max(1));
        }

        if let Some(millis) = env_parse::<u64>("UNDERTOW_REMOVAL_TIMEOUT_MS") {
            config.engine.removal_timeout = Duration::from_millis(millis);
        }

        if let Some(megabytes) = env_parse::<u64>("UNDERTOW_LOOKAHEAD_MB") {
            config.scheduler.lookahead_floor = megabytes.saturating_mul(1024 * 1024);
        }

        if let Some(dir) = env_parse::<PathBuf>("UNDERTOW_DOWNLOAD_DIR") {
            config.storage.download_dir = dir;
        }

        if let Some(dir) = env_parse::<PathBuf>("UNDERTOW_CACHE_DIR") {
            config.storage.cache_dir = dir;
        }

        if let Some(keep) = env_parse::<bool>("UNDERTOW_KEEP_FILES") {
            config.storage.keep_files = keep;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short poll interval and removal timeout keep blocking tests fast.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig {
                poll_interval: Duration::from_millis(20),
                removal_timeout: Duration::from_millis(500),
            },
            ..Default::default()
        }
    }

    /// Points both storage directories below `root`.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.storage.download_dir = root.join("downloads");
        self.storage.cache_dir = root.join("cache");
        self
    }
}
