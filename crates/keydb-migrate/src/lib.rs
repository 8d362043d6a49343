//! # keydb-migrate
//!
//! Key-by-key migration between two KeyDB/Redis instances, with post-transfer
//! validation.
//!
//! This library provides:
//!
//! - **Cursor enumeration** of the source keyspace (SCAN with MATCH/COUNT)
//! - **Type-aware transfer** of strings, hashes, lists, sets and sorted sets,
//!   preserving remaining TTL
//! - **Parallel workers** with retry and fixed or exponential backoff
//! - **Validation** comparing every key across both stores
//!
//! ## Example
//!
//! ```rust,no_run
//! use keydb_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> keydb_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Migrated {} of {} keys", result.migrated_keys, result.total_keys);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod scan;
pub mod store;
pub mod transfer;
pub mod validate;

// Re-exports for convenient access
pub use config::{BackoffStrategy, Config, MigrationConfig, StoreConfig};
pub use error::{MigrateError, Result};
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator};
pub use progress::{ProgressReporter, Stats, StatsSnapshot};
pub use scan::KeyEnumerator;
pub use store::{Key, KeyType, MemoryStore, RedisStore, StoreClient, Value};
pub use transfer::{transfer_key, FailedKey, Outcome, RetryPolicy, TransferEngine};
pub use validate::{ValidationReport, ValidationResult, Validator, Verdict};
