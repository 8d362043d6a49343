//! Migration orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::progress::{ProgressReporter, Stats};
use crate::scan::KeyEnumerator;
use crate::store::{Key, RedisStore, StoreClient};
use crate::transfer::{FailedKey, TransferEngine};
use crate::validate::{TtlCheck, ValidationReport, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn StoreClient>,
    destination: Arc<dyn StoreClient>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: completed, cancelled, timed_out or failed.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Keys discovered at the source.
    pub total_keys: u64,

    pub migrated_keys: u64,

    pub failed_keys: u64,

    pub skipped_keys: u64,

    /// Average throughput (keys/second).
    pub keys_per_second: f64,

    /// Percentage of discovered keys that were migrated.
    pub success_rate: f64,

    /// Sample of keys that failed, with the last error.
    pub failures: Vec<FailedKey>,

    /// Post-migration validation, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,

    /// Error that ended the run early, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Strict-mode verdict: any failed, skipped or non-matching key is an error.
    pub fn check_strict(&self) -> Result<()> {
        let mismatched = self
            .validation
            .as_ref()
            .map(|v| v.non_matching())
            .unwrap_or(0);
        if self.failed_keys > 0 || self.skipped_keys > 0 || mismatched > 0 {
            return Err(MigrateError::StrictModeFailure {
                failed: self.failed_keys,
                skipped: self.skipped_keys,
                mismatched,
            });
        }
        Ok(())
    }
}

/// Result of pinging both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_endpoint: String,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub destination_endpoint: String,
    pub destination_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_error: Option<String>,
}

impl HealthCheckResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Orchestrator {
    /// Wire a run over already-constructed store handles.
    pub fn new(
        config: Config,
        source: Arc<dyn StoreClient>,
        destination: Arc<dyn StoreClient>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
        }
    }

    /// Connect pooled clients to both configured stores.
    pub async fn connect(config: Config) -> Result<Self> {
        let timeout = config.migration.operation_timeout();
        let source = RedisStore::connect(&config.source, timeout).await?;
        let destination = RedisStore::connect(&config.destination, timeout).await?;
        Ok(Self::new(config, Arc::new(source), Arc::new(destination)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ping both stores and report round-trip latency.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let (source_latency_ms, source_error) = ping(self.source.as_ref()).await;
        let (destination_latency_ms, destination_error) = ping(self.destination.as_ref()).await;

        Ok(HealthCheckResult {
            healthy: source_error.is_none() && destination_error.is_none(),
            source_endpoint: self.source.name().to_string(),
            source_latency_ms,
            source_error,
            destination_endpoint: self.destination.name().to_string(),
            destination_latency_ms,
            destination_error,
        })
    }

    /// Run the migration.
    ///
    /// Fails fast when either store is unreachable or the keyspace scan breaks;
    /// per-key failures only show up in the result counters.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let migration = &self.config.migration;

        info!(
            "Starting migration run {}: {} -> {} (workers={}, batch_size={}, match={})",
            run_id,
            self.source.name(),
            self.destination.name(),
            migration.get_workers(),
            migration.batch_size,
            migration.match_pattern
        );

        self.check_connectivity().await?;

        // Run-scoped token so a timeout does not cancel the caller's token
        let run_token = cancel.child_token();
        let stats = Arc::new(Stats::new());
        let reporter =
            ProgressReporter::spawn(stats.clone(), migration.progress_interval(), &run_token);

        let watchdog = migration.run_timeout().map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(limit) => {
                        warn!("Run timeout of {:?} reached, stopping workers", limit);
                        token.cancel();
                        true
                    }
                }
            })
        });

        let transfer_result = self.transfer(stats.clone(), run_token.clone()).await;

        let timed_out = match watchdog {
            Some(handle) => {
                handle.abort();
                matches!(handle.await, Ok(true))
            }
            None => false,
        };
        reporter.stop().await;
        let snapshot = stats.snapshot();
        snapshot.log_summary();

        let (failures, mut status, error) = match transfer_result {
            Ok(failures) => (failures, "completed", None),
            Err(e) => {
                error!("Migration aborted: {}", e);
                (Vec::new(), "failed", Some(e))
            }
        };
        if timed_out {
            status = "timed_out";
        } else if status == "completed" && cancel.is_cancelled() {
            status = "cancelled";
        }

        let mut validation = None;
        if status == "completed" && migration.validate_after {
            validation = Some(self.validate(cancel.clone()).await?);
        }

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let result = MigrationResult {
            run_id,
            status: status.to_string(),
            duration_seconds,
            started_at,
            completed_at,
            total_keys: snapshot.total,
            migrated_keys: snapshot.migrated,
            failed_keys: snapshot.failed,
            skipped_keys: snapshot.skipped,
            keys_per_second: snapshot.rate_per_sec(),
            success_rate: snapshot.success_rate(),
            failures,
            validation,
            error: error.as_ref().map(|e| e.to_string()),
        };

        info!(
            "Migration {}: {} of {} keys in {:.1}s ({:.0} keys/s)",
            result.status,
            result.migrated_keys,
            result.total_keys,
            result.duration_seconds,
            result.keys_per_second
        );

        // Infrastructure faults propagate after the summary has been logged
        if let Some(e) = error {
            return Err(e);
        }
        Ok(result)
    }

    /// Validate the destination against the source without transferring.
    pub async fn validate(&self, cancel: CancellationToken) -> Result<ValidationReport> {
        self.check_connectivity().await?;
        let migration = &self.config.migration;
        let ttl_check = migration.validate_ttl.then(|| TtlCheck {
            tolerance: migration.ttl_tolerance(),
        });
        Validator::new(self.source.clone(), self.destination.clone())
            .with_ttl_check(ttl_check)
            .validate_all(migration, cancel)
            .await
    }

    /// Close both store handles.
    pub async fn close(&self) -> Result<()> {
        self.source.close().await?;
        self.destination.close().await
    }

    async fn check_connectivity(&self) -> Result<()> {
        for store in [&self.source, &self.destination] {
            store
                .ping()
                .await
                .map_err(|e| MigrateError::connection(store.name(), e.to_string()))?;
        }
        Ok(())
    }

    /// Enumerator feeding the worker pool through a bounded channel.
    async fn transfer(&self, stats: Arc<Stats>, cancel: CancellationToken) -> Result<Vec<FailedKey>> {
        let migration = &self.config.migration;
        let (tx, rx) = async_channel::bounded::<Key>(migration.batch_size.max(1));

        let enumerator = KeyEnumerator::new(
            self.source.clone(),
            migration.match_pattern.clone(),
            migration.batch_size,
        )
        .with_max_pages(migration.max_scan_pages);
        let producer = tokio::spawn(enumerator.pump(tx, Some(stats.clone()), cancel.clone()));

        let engine = TransferEngine::new(
            self.source.clone(),
            self.destination.clone(),
            stats,
            migration,
        );
        // The producer dropping its sender closes the channel, so workers drain
        // what was queued and exit even when enumeration fails
        let (enumerated, failures) = tokio::join!(producer, engine.run(cancel, rx));

        let count = enumerated
            .map_err(|e| MigrateError::Enumeration(format!("enumerator panicked: {}", e)))??;
        info!("Enumeration complete: {} keys queued", count);
        failures
    }
}

async fn ping(store: &dyn StoreClient) -> (u64, Option<String>) {
    let start = Instant::now();
    let result = store.ping().await;
    let latency = start.elapsed().as_millis() as u64;
    (latency, result.err().map(|e| e.to_string()))
}
