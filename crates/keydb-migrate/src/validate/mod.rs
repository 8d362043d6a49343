//! Post-transfer equivalence checking.
//!
//! Every key is re-read independently from both stores and compared per type.
//! The validator never writes, and a non-matching key is reported, never fatal.

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::scan::KeyEnumerator;
use crate::store::{HashValue, Key, KeyType, SetValue, SortedSetValue, StoreClient};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of comparing one key across both stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch(String),
    MissingAtDestination,
    TypeMismatch { source: KeyType, destination: KeyType },
    /// Key vanished from the source after it was enumerated.
    MissingAtSource,
    /// A read failed on either side.
    Error(String),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }

    fn label(&self) -> &'static str {
        match self {
            Verdict::Match => "match",
            Verdict::Mismatch(_) => "mismatch",
            Verdict::MissingAtDestination => "missing_at_destination",
            Verdict::TypeMismatch { .. } => "type_mismatch",
            Verdict::MissingAtSource => "missing_at_source",
            Verdict::Error(_) => "error",
        }
    }

    fn detail(&self) -> String {
        match self {
            Verdict::Mismatch(d) | Verdict::Error(d) => d.clone(),
            Verdict::TypeMismatch {
                source,
                destination,
            } => format!("source is {}, destination is {}", source, destination),
            _ => String::new(),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = self.detail();
        if detail.is_empty() {
            f.write_str(self.label())
        } else {
            write!(f, "{}: {}", self.label(), detail)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub key: String,
    pub verdict: Verdict,
}

/// Aggregate over a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checked: u64,
    pub matched: u64,
    pub mismatched: u64,
    pub missing_at_destination: u64,
    pub type_mismatches: u64,
    pub missing_at_source: u64,
    pub errors: u64,
    pub duration_seconds: f64,
    /// First non-matching keys, capped.
    pub samples: Vec<ValidationResult>,
}

/// Upper bound on non-matching results kept in the report.
pub const REPORT_SAMPLE: usize = 100;

impl ValidationReport {
    fn record(&mut self, result: ValidationResult) {
        self.checked += 1;
        match &result.verdict {
            Verdict::Match => {
                self.matched += 1;
                return;
            }
            Verdict::Mismatch(_) => self.mismatched += 1,
            Verdict::MissingAtDestination => self.missing_at_destination += 1,
            Verdict::TypeMismatch { .. } => self.type_mismatches += 1,
            Verdict::MissingAtSource => self.missing_at_source += 1,
            Verdict::Error(_) => self.errors += 1,
        }
        if self.samples.len() < REPORT_SAMPLE {
            self.samples.push(result);
        }
    }

    /// Keys whose destination copy is not known to be faithful.
    ///
    /// Keys that vanished from the source are not counted.
    pub fn non_matching(&self) -> u64 {
        self.mismatched + self.missing_at_destination + self.type_mismatches + self.errors
    }

    pub fn is_clean(&self) -> bool {
        self.non_matching() == 0
    }
}

pub fn compare_strings(source: &[u8], destination: &[u8]) -> Option<String> {
    if source == destination {
        None
    } else {
        Some(format!(
            "string differs ({} bytes at source, {} at destination)",
            source.len(),
            destination.len()
        ))
    }
}

pub fn compare_hashes(source: &HashValue, destination: &HashValue) -> Option<String> {
    if source.len() != destination.len() {
        return Some(format!(
            "hash field count {} != {}",
            source.len(),
            destination.len()
        ));
    }
    for (field, value) in source {
        match destination.get(field) {
            None => {
                return Some(format!(
                    "hash field {:?} missing at destination",
                    String::from_utf8_lossy(field)
                ))
            }
            Some(v) if v != value => {
                return Some(format!(
                    "hash field {:?} differs",
                    String::from_utf8_lossy(field)
                ))
            }
            Some(_) => {}
        }
    }
    None
}

pub fn compare_lists(source: &[Vec<u8>], destination: &[Vec<u8>]) -> Option<String> {
    if source.len() != destination.len() {
        return Some(format!(
            "list length {} != {}",
            source.len(),
            destination.len()
        ));
    }
    source
        .iter()
        .zip(destination)
        .position(|(a, b)| a != b)
        .map(|i| format!("list element {} differs", i))
}

pub fn compare_sets(source: &SetValue, destination: &SetValue) -> Option<String> {
    if source.len() != destination.len() {
        return Some(format!(
            "set cardinality {} != {}",
            source.len(),
            destination.len()
        ));
    }
    source
        .difference(destination)
        .next()
        .map(|m| format!("set member {:?} missing at destination", String::from_utf8_lossy(m)))
}

/// Position-by-position comparison in the stores' rank order.
pub fn compare_sorted_sets(source: &SortedSetValue, destination: &SortedSetValue) -> Option<String> {
    if source.len() != destination.len() {
        return Some(format!(
            "sorted set cardinality {} != {}",
            source.len(),
            destination.len()
        ));
    }
    for (rank, ((m1, s1), (m2, s2))) in source.iter().zip(destination).enumerate() {
        if m1 != m2 {
            return Some(format!(
                "sorted set member at rank {} differs ({:?} vs {:?})",
                rank,
                String::from_utf8_lossy(m1),
                String::from_utf8_lossy(m2)
            ));
        }
        if s1 != s2 {
            return Some(format!(
                "sorted set score of {:?} differs ({} vs {})",
                String::from_utf8_lossy(m1),
                s1,
                s2
            ));
        }
    }
    None
}

/// Optional TTL comparison settings.
#[derive(Debug, Clone, Copy)]
pub struct TtlCheck {
    pub tolerance: Duration,
}

pub fn compare_ttls(
    source: Option<Duration>,
    destination: Option<Duration>,
    tolerance: Duration,
) -> Option<String> {
    match (source, destination) {
        (None, None) => None,
        (Some(s), None) => Some(format!("ttl {:?} at source, none at destination", s)),
        (None, Some(d)) => Some(format!("no ttl at source, {:?} at destination", d)),
        (Some(s), Some(d)) => {
            let drift = if s > d { s - d } else { d - s };
            (drift > tolerance).then(|| format!("ttl drift {:?} exceeds {:?}", drift, tolerance))
        }
    }
}

/// Read-only comparison of keys across both stores.
pub struct Validator {
    source: Arc<dyn StoreClient>,
    destination: Arc<dyn StoreClient>,
    ttl_check: Option<TtlCheck>,
}

impl Validator {
    pub fn new(source: Arc<dyn StoreClient>, destination: Arc<dyn StoreClient>) -> Self {
        Self {
            source,
            destination,
            ttl_check: None,
        }
    }

    pub fn with_ttl_check(mut self, ttl_check: Option<TtlCheck>) -> Self {
        self.ttl_check = ttl_check;
        self
    }

    /// Compare `key` across both stores. Read failures become `Verdict::Error`.
    pub async fn validate_key(&self, key: &Key) -> ValidationResult {
        let verdict = match self.compare(key).await {
            Ok(verdict) => verdict,
            Err(e) => Verdict::Error(e.to_string()),
        };
        ValidationResult {
            key: key.to_string(),
            verdict,
        }
    }

    async fn compare(&self, key: &Key) -> Result<Verdict> {
        if !self.destination.exists(key).await? {
            return Ok(if self.source.exists(key).await? {
                Verdict::MissingAtDestination
            } else {
                Verdict::MissingAtSource
            });
        }

        let source_type = self.source.type_of(key).await?;
        if source_type == KeyType::None {
            return Ok(Verdict::MissingAtSource);
        }
        let destination_type = self.destination.type_of(key).await?;
        if source_type != destination_type {
            return Ok(Verdict::TypeMismatch {
                source: source_type,
                destination: destination_type,
            });
        }

        let difference = match &source_type {
            KeyType::String => {
                let src = self.source.get_string(key).await?;
                let dst = self.destination.get_string(key).await?;
                match (src, dst) {
                    (None, _) => return Ok(Verdict::MissingAtSource),
                    (Some(_), None) => return Ok(Verdict::MissingAtDestination),
                    (Some(a), Some(b)) => compare_strings(&a, &b),
                }
            }
            KeyType::Hash => compare_hashes(
                &self.source.get_hash(key).await?,
                &self.destination.get_hash(key).await?,
            ),
            KeyType::List => compare_lists(
                &self.source.get_list(key).await?,
                &self.destination.get_list(key).await?,
            ),
            KeyType::Set => compare_sets(
                &self.source.get_set(key).await?,
                &self.destination.get_set(key).await?,
            ),
            KeyType::SortedSet => compare_sorted_sets(
                &self.source.get_sorted_set(key).await?,
                &self.destination.get_sorted_set(key).await?,
            ),
            KeyType::None | KeyType::Other(_) => None,
        };
        if let Some(detail) = difference {
            return Ok(Verdict::Mismatch(detail));
        }

        if let Some(check) = self.ttl_check {
            let src = self.source.remaining_ttl(key).await?;
            let dst = self.destination.remaining_ttl(key).await?;
            if let Some(detail) = compare_ttls(src, dst, check.tolerance) {
                return Ok(Verdict::Mismatch(detail));
            }
        }

        Ok(Verdict::Match)
    }

    /// Enumerate the source keyspace and validate every key with a worker pool.
    ///
    /// Logs one line per non-matching key. Only enumeration failures are
    /// returned as errors.
    pub async fn validate_all(
        &self,
        config: &MigrationConfig,
        cancel: CancellationToken,
    ) -> Result<ValidationReport> {
        let start = Instant::now();
        let workers = config.get_workers().max(1);
        let (tx, rx) = async_channel::bounded::<Key>(config.batch_size.max(1));
        let shared = Arc::new(Mutex::new(ValidationReport::default()));

        info!(
            "Validating {} against {} with {} workers",
            self.destination.name(),
            self.source.name(),
            workers
        );

        let enumerator = KeyEnumerator::new(
            self.source.clone(),
            config.match_pattern.clone(),
            config.batch_size,
        )
        .with_max_pages(config.max_scan_pages);
        let producer = tokio::spawn(enumerator.pump(tx, None, cancel.clone()));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let validator = Validator {
                source: self.source.clone(),
                destination: self.destination.clone(),
                ttl_check: self.ttl_check,
            };
            let rx = rx.clone();
            let report = shared.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = rx.recv() => match next {
                            Ok(key) => key,
                            Err(_) => break,
                        },
                    };
                    let result = validator.validate_key(&key).await;
                    if !result.verdict.is_match() {
                        warn!(
                            key = %result.key,
                            verdict = result.verdict.label(),
                            detail = %result.verdict.detail(),
                            "Validation mismatch"
                        );
                    }
                    report
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .record(result);
                }
            }));
        }
        drop(rx);

        for joined in join_all(handles).await {
            joined.map_err(|e| {
                MigrateError::transfer("<validator>", format!("worker panicked: {}", e))
            })?;
        }
        let enumerated = producer
            .await
            .map_err(|e| MigrateError::Enumeration(format!("enumerator panicked: {}", e)))??;

        let mut report = std::mem::take(&mut *shared.lock().unwrap_or_else(|e| e.into_inner()));
        report.duration_seconds = start.elapsed().as_secs_f64();

        debug!("Validation enumerated {} keys", enumerated);
        info!(
            checked = report.checked,
            matched = report.matched,
            mismatched = report.mismatched,
            missing_at_destination = report.missing_at_destination,
            type_mismatches = report.type_mismatches,
            missing_at_source = report.missing_at_source,
            errors = report.errors,
            duration = %format!("{:.1}s", report.duration_seconds),
            "Validation summary"
        );

        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Value};

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    async fn verdict(validator: &Validator, key: &str) -> Verdict {
        validator.validate_key(&Key::from(key)).await.verdict
    }

    #[test]
    fn test_compare_hashes() {
        let a: HashValue = [(b("f1"), b("v1")), (b("f2"), b("v2"))].into_iter().collect();
        let mut c = a.clone();
        assert_eq!(compare_hashes(&a, &c), None);
        c.insert(b("f2"), b("other"));
        assert!(compare_hashes(&a, &c).unwrap().contains("f2"));
        c.remove(&b("f2"));
        assert!(compare_hashes(&a, &c).is_some());
    }

    #[test]
    fn test_compare_lists_is_positional() {
        let a = vec![b("x"), b("y")];
        let c = vec![b("y"), b("x")];
        assert_eq!(compare_lists(&a, &a), None);
        assert_eq!(compare_lists(&a, &c).unwrap(), "list element 0 differs");
    }

    #[test]
    fn test_compare_sets_ignores_order() {
        let a: SetValue = [b("1"), b("2")].into_iter().collect();
        let c: SetValue = [b("2"), b("1")].into_iter().collect();
        assert_eq!(compare_sets(&a, &c), None);
    }

    #[test]
    fn test_compare_sorted_sets_with_ties() {
        // equal scores: rank order breaks ties by member
        let src = vec![(b("a"), 1.0), (b("b"), 1.0)];
        let same = vec![(b("a"), 1.0), (b("b"), 1.0)];
        let swapped = vec![(b("b"), 1.0), (b("a"), 1.0)];
        let rescored = vec![(b("a"), 1.0), (b("b"), 2.0)];
        assert_eq!(compare_sorted_sets(&src, &same), None);
        assert!(compare_sorted_sets(&src, &swapped).is_some());
        assert!(compare_sorted_sets(&src, &rescored).unwrap().contains("score"));
    }

    #[test]
    fn test_compare_ttls() {
        let tol = Duration::from_secs(2);
        assert_eq!(compare_ttls(None, None, tol), None);
        assert_eq!(
            compare_ttls(Some(Duration::from_secs(60)), Some(Duration::from_secs(59)), tol),
            None
        );
        assert!(compare_ttls(Some(Duration::from_secs(60)), None, tol).is_some());
        assert!(
            compare_ttls(Some(Duration::from_secs(60)), Some(Duration::from_secs(30)), tol)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_validate_key_verdicts() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.insert("same", Value::String(b("v")), None);
        dst.insert("same", Value::String(b("v")), None);
        src.insert("missing", Value::String(b("v")), None);
        src.insert("typed", Value::String(b("v")), None);
        dst.insert("typed", Value::List(vec![b("v")]), None);
        src.insert("diff", Value::String(b("v")), None);
        dst.insert("diff", Value::String(b("w")), None);
        dst.insert("orphan", Value::String(b("v")), None);

        let v = Validator::new(src, dst);
        assert_eq!(verdict(&v, "same").await, Verdict::Match);
        assert_eq!(verdict(&v, "missing").await, Verdict::MissingAtDestination);
        assert_eq!(
            verdict(&v, "typed").await,
            Verdict::TypeMismatch {
                source: KeyType::String,
                destination: KeyType::List
            }
        );
        assert!(matches!(verdict(&v, "diff").await, Verdict::Mismatch(_)));
        assert_eq!(verdict(&v, "orphan").await, Verdict::MissingAtSource);
    }

    #[tokio::test]
    async fn test_read_error_is_reported_not_fatal() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        dst.set_available(false);
        let validator = Validator::new(src, dst);
        let result = validator.validate_key(&Key::from("k")).await;
        assert!(matches!(result.verdict, Verdict::Error(_)));
    }

    #[test]
    fn test_report_counts_and_samples() {
        let mut report = ValidationReport::default();
        report.record(ValidationResult {
            key: "a".into(),
            verdict: Verdict::Match,
        });
        report.record(ValidationResult {
            key: "b".into(),
            verdict: Verdict::MissingAtDestination,
        });
        report.record(ValidationResult {
            key: "c".into(),
            verdict: Verdict::MissingAtSource,
        });
        assert_eq!(report.checked, 3);
        assert_eq!(report.matched, 1);
        assert_eq!(report.non_matching(), 1);
        assert_eq!(report.samples.len(), 2);
        assert!(!report.is_clean());
    }
}
