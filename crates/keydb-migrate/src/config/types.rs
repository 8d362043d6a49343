//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();

        Self {
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!("System resources: {} CPU cores", self.cpu_cores);
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store the keys are read from.
    pub source: StoreConfig,

    /// Store the keys are written to.
    pub destination: StoreConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set, so call it after any
    /// command-line overrides.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.apply_auto_tuning(&resources);
        self
    }

    /// Fill unset workers from the core count and make sure each store pool
    /// can serve every worker at once.
    pub fn apply_auto_tuning(&mut self, resources: &SystemResources) {
        if self.migration.workers.is_none() {
            // I/O bound: two workers per core, 4..=64
            let workers = (resources.cpu_cores * 2).clamp(4, 64);
            self.migration.workers = Some(workers);
        }
        let workers = self.migration.get_workers();

        self.source.pool_size = self.source.pool_size.max(workers as u32);
        self.destination.pool_size = self.destination.pool_size.max(workers as u32);

        info!(
            "Auto-tuned config: workers={}, source_pool={}, destination_pool={}, batch_size={}",
            workers,
            self.source.pool_size,
            self.destination.pool_size,
            self.migration.batch_size,
        );
    }
}

/// Connection settings for one KeyDB/Redis instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port (default: 6379).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional AUTH password.
    #[serde(default)]
    pub password: String,

    /// Optional ACL username (used together with password).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Logical database index (default: 0).
    #[serde(default)]
    pub database: i64,

    /// Maximum pooled connections (default: 20).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: String::new(),
            username: None,
            database: 0,
            pool_size: default_pool_size(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("username", &self.username)
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt.
    Fixed,

    /// Delay doubles after every attempt, capped at `max_retry_delay_ms`.
    #[default]
    Exponential,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// SCAN page size (COUNT hint).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of parallel workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// SCAN MATCH pattern (default: "*").
    #[serde(default = "default_match_pattern")]
    pub match_pattern: String,

    /// Upper bound on SCAN round trips before the scan is treated as stuck.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_scan_pages: Option<u64>,

    /// Timeout applied to every single store call, in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Overall run timeout in seconds (0 disables).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first failed attempt of a key.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base delay between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Cap for exponential backoff, in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Backoff strategy (default: exponential).
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Seconds between progress log lines.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// Run a validation pass right after the transfer.
    #[serde(default)]
    pub validate_after: bool,

    /// Also compare remaining TTLs when validating.
    #[serde(default)]
    pub validate_ttl: bool,

    /// Allowed TTL drift when `validate_ttl` is set, in milliseconds.
    #[serde(default = "default_ttl_tolerance_ms")]
    pub ttl_tolerance_ms: u64,

    /// Treat failed or skipped keys as a run failure.
    #[serde(default)]
    pub strict: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: None,
            match_pattern: default_match_pattern(),
            max_scan_pages: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            timeout_secs: default_timeout_secs(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff: BackoffStrategy::default(),
            progress_interval_secs: default_progress_interval_secs(),
            validate_after: false,
            validate_ttl: false,
            ttl_tolerance_ms: default_ttl_tolerance_ms(),
            strict: false,
        }
    }
}

impl MigrationConfig {
    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(10)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Overall run deadline, `None` when disabled.
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    pub fn ttl_tolerance(&self) -> Duration {
        Duration::from_millis(self.ttl_tolerance_ms)
    }
}

// Default value functions for serde
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_pool_size() -> u32 {
    20
}

fn default_batch_size() -> usize {
    1000
}

fn default_match_pattern() -> String {
    "*".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_progress_interval_secs() -> u64 {
    10
}

fn default_ttl_tolerance_ms() -> u64 {
    2_000
}
