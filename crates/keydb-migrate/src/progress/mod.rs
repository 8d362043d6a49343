//! Run counters, the periodic progress reporter and the final summary.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    migrated: u64,
    failed: u64,
    skipped: u64,
}

/// Shared run counters.
///
/// Every mutation goes through one mutex so a snapshot is always a
/// consistent tuple. `total` grows while enumeration streams and is never
/// lowered.
#[derive(Debug)]
pub struct Stats {
    counters: Mutex<Counters>,
    started: Instant,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub migrated: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raise the total to `total`; a lower value is ignored.
    pub fn set_total(&self, total: u64) {
        let mut c = self.lock();
        c.total = c.total.max(total);
    }

    /// Count keys handed out by the enumerator.
    pub fn add_discovered(&self, count: u64) {
        self.lock().total += count;
    }

    pub fn increment_migrated(&self) {
        self.lock().migrated += 1;
    }

    pub fn increment_failed(&self) {
        self.lock().failed += 1;
    }

    pub fn increment_skipped(&self) {
        self.lock().skipped += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.lock();
        StatsSnapshot {
            total: c.total,
            migrated: c.migrated,
            failed: c.failed,
            skipped: c.skipped,
            elapsed: self.started.elapsed(),
        }
    }
}

impl StatsSnapshot {
    /// Keys with a recorded outcome.
    pub fn processed(&self) -> u64 {
        self.migrated + self.failed + self.skipped
    }

    /// Migrated keys per second; 0 before anything has been migrated.
    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 || self.migrated == 0 {
            0.0
        } else {
            self.migrated as f64 / secs
        }
    }

    /// `migrated / total * 100`, 0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.migrated as f64 / self.total as f64 * 100.0
        }
    }

    /// Periodic progress line.
    pub fn log_progress(&self) {
        info!(
            total = self.total,
            migrated = self.migrated,
            failed = self.failed,
            skipped = self.skipped,
            rate_per_sec = %format!("{:.1}", self.rate_per_sec()),
            elapsed = %format!("{:.1}s", self.elapsed.as_secs_f64()),
            "Migration progress"
        );
    }

    /// Final summary line; emitted once per completed run.
    pub fn log_summary(&self) {
        info!(
            total_keys = self.total,
            migrated_keys = self.migrated,
            failed_keys = self.failed,
            skipped_keys = self.skipped,
            duration = %format!("{:.1}s", self.elapsed.as_secs_f64()),
            success_rate = %format!("{:.2}%", self.success_rate()),
            "Migration summary"
        );
    }
}

/// Background task logging a [`StatsSnapshot`] every interval.
///
/// Runs on a child of the run token, so cancelling the run stops it too;
/// [`ProgressReporter::stop`] waits for the task to exit.
pub struct ProgressReporter {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(stats: Arc<Stats>, interval: Duration, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => stats.snapshot().log_progress(),
                }
            }
            debug!("Progress reporter stopped");
        });

        Self { token, handle }
    }

    /// Stop the reporter and wait until it has exited.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_partition() {
        let stats = Stats::new();
        stats.add_discovered(4);
        stats.increment_migrated();
        stats.increment_migrated();
        stats.increment_failed();
        stats.increment_skipped();

        let snap = stats.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.processed(), snap.total);
        assert_eq!(snap.success_rate(), 50.0);
    }

    #[test]
    fn test_set_total_never_decreases() {
        let stats = Stats::new();
        stats.set_total(10);
        stats.set_total(3);
        assert_eq!(stats.snapshot().total, 10);
    }

    #[test]
    fn test_rates_are_zero_for_empty_run() {
        let snap = StatsSnapshot::default();
        assert_eq!(snap.rate_per_sec(), 0.0);
        assert_eq!(snap.success_rate(), 0.0);

        let snap = StatsSnapshot {
            total: 5,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(snap.rate_per_sec(), 0.0);
    }

    #[test]
    fn test_rate_per_sec() {
        let snap = StatsSnapshot {
            total: 100,
            migrated: 100,
            elapsed: Duration::from_secs(4),
            ..Default::default()
        };
        assert_eq!(snap.rate_per_sec(), 25.0);
    }

    #[tokio::test]
    async fn test_reporter_stops_with_parent() {
        let parent = CancellationToken::new();
        let reporter = ProgressReporter::spawn(
            Arc::new(Stats::new()),
            Duration::from_millis(5),
            &parent,
        );
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), reporter.stop())
            .await
            .unwrap();
    }
}
