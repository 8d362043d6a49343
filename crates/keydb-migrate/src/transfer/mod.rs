//! Type-aware key transfer and the worker pool that drives it.
//!
//! - [`transfer_key`] moves one key: TYPE, PTTL, one read, one replacing
//!   write, then PEXPIRE when the source key carries a TTL.
//! - [`TransferEngine`] runs a fixed pool of workers over a shared key channel,
//!   retrying transient failures with backoff and recording one
//!   [`Outcome`] per key.

use crate::config::{BackoffStrategy, MigrationConfig};
use crate::error::{MigrateError, Result};
use crate::progress::Stats;
use crate::store::{Key, KeyType, StoreClient};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on failed keys kept for the run result.
pub const FAILED_KEY_SAMPLE: usize = 100;

/// Result of transferring a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Migrated,
    Failed(String),
    Skipped(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Migrated => f.write_str("migrated"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// A key that ended up `Failed`, kept for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedKey {
    pub key: String,
    pub reason: String,
}

/// Copy `key` from `source` to `destination`.
///
/// `Ok(Skipped)` for keys that vanished or have no transfer routine; store
/// errors are returned so the caller can decide whether to retry.
pub async fn transfer_key(
    source: &dyn StoreClient,
    destination: &dyn StoreClient,
    key: &Key,
) -> Result<Outcome> {
    let key_type = source.type_of(key).await?;
    match &key_type {
        KeyType::None => return Ok(Outcome::Skipped("key no longer exists at source".into())),
        KeyType::Other(name) => return Ok(Outcome::Skipped(format!("unsupported type: {}", name))),
        _ => {}
    }

    let ttl = source.remaining_ttl(key).await?;

    let value = match source.read_value(key, &key_type).await? {
        Some(value) => value,
        None => return Ok(Outcome::Skipped("key no longer exists at source".into())),
    };

    destination.write_value(key, &value, None).await?;

    if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
        if let Err(e) = destination.apply_ttl(key, ttl).await {
            warn!(key = %key, error = %e, "Value written but TTL not applied");
        }
    }

    debug!("{}: migrated {} ({} elements)", key, key_type, value.len());
    Ok(Outcome::Migrated)
}

/// Retry budget and delay schedule for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            retries: config.retry_count,
            base_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
            strategy: config.backoff,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

/// Fixed-size worker pool moving keys from source to destination.
pub struct TransferEngine {
    source: Arc<dyn StoreClient>,
    destination: Arc<dyn StoreClient>,
    stats: Arc<Stats>,
    workers: usize,
    retry: RetryPolicy,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn StoreClient>,
        destination: Arc<dyn StoreClient>,
        stats: Arc<Stats>,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            source,
            destination,
            stats,
            workers: config.get_workers().max(1),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Drain `keys` with the worker pool until the channel is closed and empty
    /// or `cancel` fires.
    ///
    /// Per-key failures are recorded in the stats, never returned; the result
    /// is a sample of the keys that failed.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        keys: async_channel::Receiver<Key>,
    ) -> Result<Vec<FailedKey>> {
        let mut handles = Vec::with_capacity(self.workers);

        for worker_id in 0..self.workers {
            let worker = Worker {
                id: worker_id,
                source: self.source.clone(),
                destination: self.destination.clone(),
                stats: self.stats.clone(),
                retry: self.retry,
                cancel: cancel.clone(),
            };
            let keys = keys.clone();
            handles.push(tokio::spawn(worker.run(keys)));
        }

        // Drop our receiver so the channel closes when the sender finishes
        drop(keys);

        let mut failed = Vec::new();
        for joined in join_all(handles).await {
            let sample = joined
                .map_err(|e| MigrateError::transfer("<worker>", format!("worker panicked: {}", e)))?;
            failed.extend(sample);
        }
        failed.truncate(FAILED_KEY_SAMPLE);
        Ok(failed)
    }
}

struct Worker {
    id: usize,
    source: Arc<dyn StoreClient>,
    destination: Arc<dyn StoreClient>,
    stats: Arc<Stats>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, keys: async_channel::Receiver<Key>) -> Vec<FailedKey> {
        let mut failed = Vec::new();
        let mut processed = 0u64;

        loop {
            let key = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = keys.recv() => match next {
                    Ok(key) => key,
                    Err(_) => break,
                },
            };

            let outcome = match self.transfer_with_retry(&key).await {
                Some(outcome) => outcome,
                // Cancelled between attempts; the key keeps no outcome
                None => break,
            };
            processed += 1;

            match outcome {
                Outcome::Migrated => self.stats.increment_migrated(),
                Outcome::Skipped(reason) => {
                    debug!(key = %key, reason = %reason, "Key skipped");
                    self.stats.increment_skipped();
                }
                Outcome::Failed(reason) => {
                    warn!(key = %key, reason = %reason, "Key failed");
                    self.stats.increment_failed();
                    if failed.len() < FAILED_KEY_SAMPLE {
                        failed.push(FailedKey {
                            key: key.to_string(),
                            reason,
                        });
                    }
                }
            }
        }

        debug!("Worker {}: processed {} keys", self.id, processed);
        failed
    }

    /// `None` only when cancelled while waiting to retry.
    async fn transfer_with_retry(&self, key: &Key) -> Option<Outcome> {
        let mut retry = 0u32;
        loop {
            // Store calls carry their own deadline, so the attempt itself is unbounded
            let result =
                transfer_key(self.source.as_ref(), self.destination.as_ref(), key).await;
            let err = match result {
                Ok(outcome) => return Some(outcome),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Some(Outcome::Failed(err.to_string()));
            }
            if retry >= self.retry.retries {
                return Some(Outcome::Failed(format!(
                    "{} (after {} attempts)",
                    err,
                    retry + 1
                )));
            }

            retry += 1;
            let delay = self.retry.delay(retry);
            debug!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                key, retry, err, delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Value};

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(500));
        assert_eq!(p.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(BackoffStrategy::Fixed);
        assert_eq!(p.delay(1), p.delay(5));
    }

    #[tokio::test]
    async fn test_transfer_string_with_ttl() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("s", Value::String(b"hello".to_vec()), Some(Duration::from_secs(60)));

        let outcome = transfer_key(&src, &dst, &Key::from("s")).await.unwrap();
        assert_eq!(outcome, Outcome::Migrated);
        assert_eq!(dst.value("s"), Some(Value::String(b"hello".to_vec())));
        let ttl = dst.remaining_ttl(&Key::from("s")).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(55));
    }

    #[tokio::test]
    async fn test_empty_string_is_migrated() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("e", Value::String(Vec::new()), None);

        let outcome = transfer_key(&src, &dst, &Key::from("e")).await.unwrap();
        assert_eq!(outcome, Outcome::Migrated);
        assert_eq!(dst.value("e"), Some(Value::String(Vec::new())));
    }

    #[tokio::test]
    async fn test_vanished_key_is_skipped() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        let outcome = transfer_key(&src, &dst, &Key::from("gone")).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_write_replaces_existing_value() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.insert("l", Value::List(vec![b"a".to_vec(), b"b".to_vec()]), None);
        dst.insert("l", Value::List(vec![b"stale".to_vec()]), Some(Duration::from_secs(5)));

        transfer_key(&src, &dst, &Key::from("l")).await.unwrap();
        assert_eq!(
            dst.value("l"),
            Some(Value::List(vec![b"a".to_vec(), b"b".to_vec()]))
        );
        assert_eq!(dst.remaining_ttl(&Key::from("l")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_engine_drains_channel() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        for i in 0..20 {
            src.insert(format!("k{i}"), Value::String(vec![b'x'; i]), None);
        }
        let stats = Arc::new(Stats::new());
        let config = MigrationConfig {
            workers: Some(4),
            ..Default::default()
        };
        let engine = TransferEngine::new(src.clone(), dst.clone(), stats.clone(), &config);

        let (tx, rx) = async_channel::bounded(8);
        let producer = tokio::spawn(async move {
            for i in 0..20 {
                tx.send(Key::from(format!("k{i}"))).await.unwrap();
            }
        });
        stats.add_discovered(20);

        let failed = engine.run(CancellationToken::new(), rx).await.unwrap();
        producer.await.unwrap();

        assert!(failed.is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.migrated, 20);
        assert_eq!(snap.processed(), snap.total);
        assert_eq!(dst.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_attempts() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.insert("k", Value::String(b"v".to_vec()), None);
        dst.set_available(false);

        let stats = Arc::new(Stats::new());
        let config = MigrationConfig {
            workers: Some(1),
            retry_count: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 3_000,
            backoff: BackoffStrategy::Exponential,
            ..Default::default()
        };
        let engine = TransferEngine::new(src, dst, stats.clone(), &config);
        let (tx, rx) = async_channel::bounded(1);
        tx.send(Key::from("k")).await.unwrap();
        drop(tx);

        let start = tokio::time::Instant::now();
        let failed = engine.run(CancellationToken::new(), rx).await.unwrap();

        // 1s + 2s + 3s (capped)
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert!(failed[0].reason.contains("after 4 attempts"));
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_leaves_key_unrecorded() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.insert("k", Value::String(b"v".to_vec()), None);
        dst.set_available(false);

        let stats = Arc::new(Stats::new());
        let config = MigrationConfig {
            workers: Some(1),
            retry_count: 10,
            retry_delay_ms: 60_000,
            max_retry_delay_ms: 60_000,
            ..Default::default()
        };
        let engine = TransferEngine::new(src, dst, stats.clone(), &config);
        let (tx, rx) = async_channel::bounded(1);
        tx.send(Key::from("k")).await.unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        engine.run(cancel, rx).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(stats.snapshot().processed(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failure() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.insert("k", Value::String(b"v".to_vec()), None);
        dst.set_available(false);

        let stats = Arc::new(Stats::new());
        let config = MigrationConfig {
            workers: Some(1),
            retry_count: 0,
            ..Default::default()
        };
        let engine = TransferEngine::new(src, dst, stats.clone(), &config);
        let (tx, rx) = async_channel::bounded(1);
        tx.send(Key::from("k")).await.unwrap();
        drop(tx);

        let failed = engine.run(CancellationToken::new(), rx).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, "k");
        assert_eq!(stats.snapshot().failed, 1);
    }
}
