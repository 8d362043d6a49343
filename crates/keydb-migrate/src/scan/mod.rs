//! Cursor-driven keyspace enumeration.

use crate::error::{MigrateError, Result};
use crate::progress::Stats;
use crate::store::{Key, StoreClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lazy, single-pass walk over the source keyspace.
///
/// Pages are requested one at a time; each page is handed off before the next
/// SCAN is issued. Once the cursor returns to 0, or any page fails, the
/// enumerator is exhausted and yields nothing further.
pub struct KeyEnumerator {
    source: Arc<dyn StoreClient>,
    pattern: String,
    batch_size: usize,
    max_pages: Option<u64>,
    cursor: u64,
    pages: u64,
    exhausted: bool,
}

impl KeyEnumerator {
    pub fn new(source: Arc<dyn StoreClient>, pattern: impl Into<String>, batch_size: usize) -> Self {
        Self {
            source,
            pattern: pattern.into(),
            batch_size: batch_size.max(1),
            max_pages: None,
            cursor: 0,
            pages: 0,
            exhausted: false,
        }
    }

    /// Give up with an enumeration error after this many SCAN round trips.
    pub fn with_max_pages(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page. `Ok(None)` once the scan has completed.
    ///
    /// A page may be empty while the cursor is still non-zero; callers keep
    /// pulling until `None`.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Key>>> {
        if self.exhausted {
            return Ok(None);
        }

        if let Some(max) = self.max_pages {
            if self.pages >= max {
                self.exhausted = true;
                return Err(MigrateError::Enumeration(format!(
                    "{}: scan did not complete within {} pages",
                    self.source.name(),
                    max
                )));
            }
        }

        let sent = self.cursor;
        let (keys, next) = match self
            .source
            .scan_page(sent, &self.pattern, self.batch_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Err(e);
            }
        };
        self.pages += 1;

        if next != 0 && next == sent {
            self.exhausted = true;
            return Err(MigrateError::Enumeration(format!(
                "{}: cursor {} did not advance",
                self.source.name(),
                sent
            )));
        }

        self.cursor = next;
        if next == 0 {
            self.exhausted = true;
        }
        Ok(Some(keys))
    }

    /// Stream every key into `tx`, counting each page into `stats`.
    ///
    /// Returns the number of keys sent. Stops early, without error, when
    /// `cancel` fires or every receiver has gone away.
    pub async fn pump(
        mut self,
        tx: async_channel::Sender<Key>,
        stats: Option<Arc<Stats>>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let mut sent = 0u64;

        'pages: while !cancel.is_cancelled() {
            let keys = match self.next_page().await? {
                Some(keys) => keys,
                None => break,
            };
            if let Some(stats) = &stats {
                stats.add_discovered(keys.len() as u64);
            }
            for key in keys {
                let delivered = tokio::select! {
                    _ = cancel.cancelled() => false,
                    res = tx.send(key) => res.is_ok(),
                };
                if !delivered {
                    debug!("Enumeration stopped early after {} keys", sent);
                    break 'pages;
                }
                sent += 1;
            }
        }

        info!(
            "Enumerated {} keys from {} in {} pages",
            sent,
            self.source.name(),
            self.pages
        );
        Ok(sent)
    }
}
