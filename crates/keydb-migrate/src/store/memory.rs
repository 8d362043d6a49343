//! In-process store with TTL bookkeeping and a deterministic cursor scan.

use super::{HashValue, Key, KeyType, SetValue, SortedSetValue, StoreClient, Value};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`StoreClient`].
///
/// Keys are kept ordered, so a SCAN cursor is simply the offset of the next
/// key. Sorted sets are kept in rank order (score, then member bytes).
pub struct MemoryStore {
    name: String,
    entries: Mutex<BTreeMap<Key, Entry>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Seed a key directly, bypassing the client surface.
    pub fn insert(&self, key: impl Into<Key>, value: Value, ttl: Option<Duration>) {
        let value = match value {
            Value::SortedSet(members) => Value::SortedSet(rank_order(members)),
            other => other,
        };
        let entry = Entry {
            value,
            expires_at: expiry(ttl),
        };
        self.lock().insert(key.into(), entry);
    }

    /// Current value of a key, if present and not expired.
    pub fn value(&self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        self.live(&key, |e| e.value.clone())
    }

    /// Remove a key; returns whether it existed.
    pub fn delete(&self, key: impl Into<Key>) -> bool {
        self.lock().remove(&key.into()).is_some()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate the store going away; every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, Entry>> {
        // A panic while holding the lock leaves the map itself intact
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MigrateError::connection(&self.name, "store unavailable"))
        }
    }

    /// Apply `f` to the live entry for `key`, purging it if expired.
    fn live<T>(&self, key: &Key, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(e) if e.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(e) => Some(f(e)),
            None => None,
        }
    }

    fn wrong_type(&self, key: &Key, expected: KeyType) -> MigrateError {
        MigrateError::Store(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
            format!("{} is not a {}", key, expected),
        )))
    }

    fn put(&self, key: &Key, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let expires_at = expiry(ttl);
        self.lock().insert(key.clone(), Entry { value, expires_at });
        Ok(())
    }

    fn get_as<T>(
        &self,
        key: &Key,
        expected: KeyType,
        empty: T,
        extract: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<T> {
        self.check_available()?;
        match self.live(key, |e| extract(&e.value)) {
            None => Ok(empty),
            Some(Some(v)) => Ok(v),
            Some(None) => Err(self.wrong_type(key, expected)),
        }
    }
}

/// A zero TTL means no expiration.
fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t)
}

/// Store rank order: ascending score, ties broken by member bytes. A member
/// given more than once keeps its last score, as with ZADD.
fn rank_order(members: SortedSetValue) -> SortedSetValue {
    let mut members: SortedSetValue = members
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .collect();
    members.sort_by(|(ma, sa), (mb, sb)| {
        sa.partial_cmp(sb)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| ma.cmp(mb))
    });
    members
}

/// SCAN MATCH subset: `*` and `?` wildcards, everything else literal.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(Vec<Key>, u64)> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.lock();
        let start = cursor as usize;
        let page: Vec<&Key> = entries.keys().skip(start).take(count.max(1)).collect();
        let next = start + page.len();
        let next_cursor = if next >= entries.len() { 0 } else { next as u64 };
        let keys = page
            .into_iter()
            .filter(|k| !entries[*k].is_expired(now))
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        Ok((keys, next_cursor))
    }

    async fn type_of(&self, key: &Key) -> Result<KeyType> {
        self.check_available()?;
        Ok(self
            .live(key, |e| e.value.key_type())
            .unwrap_or(KeyType::None))
    }

    async fn remaining_ttl(&self, key: &Key) -> Result<Option<Duration>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .live(key, |e| e.expires_at.map(|at| at.saturating_duration_since(now)))
            .flatten()
            .filter(|d| !d.is_zero()))
    }

    async fn get_string(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.get_as(key, KeyType::String, None, |v| match v {
            Value::String(s) => Some(Some(s.clone())),
            _ => None,
        })
    }

    async fn get_hash(&self, key: &Key) -> Result<HashValue> {
        self.get_as(key, KeyType::Hash, HashValue::new(), |v| match v {
            Value::Hash(h) => Some(h.clone()),
            _ => None,
        })
    }

    async fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        self.get_as(key, KeyType::List, Vec::new(), |v| match v {
            Value::List(l) => Some(l.clone()),
            _ => None,
        })
    }

    async fn get_set(&self, key: &Key) -> Result<SetValue> {
        self.get_as(key, KeyType::Set, SetValue::new(), |v| match v {
            Value::Set(s) => Some(s.clone()),
            _ => None,
        })
    }

    async fn get_sorted_set(&self, key: &Key) -> Result<SortedSetValue> {
        self.get_as(key, KeyType::SortedSet, Vec::new(), |v| match v {
            Value::SortedSet(z) => Some(z.clone()),
            _ => None,
        })
    }

    async fn set_string(&self, key: &Key, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.put(key, Value::String(value.to_vec()), ttl)
    }

    async fn set_hash(&self, key: &Key, value: &HashValue, ttl: Option<Duration>) -> Result<()> {
        self.put(key, Value::Hash(value.clone()), ttl)
    }

    async fn set_list(&self, key: &Key, value: &[Vec<u8>], ttl: Option<Duration>) -> Result<()> {
        self.put(key, Value::List(value.to_vec()), ttl)
    }

    async fn set_set(&self, key: &Key, value: &SetValue, ttl: Option<Duration>) -> Result<()> {
        self.put(key, Value::Set(value.clone()), ttl)
    }

    async fn set_sorted_set(
        &self,
        key: &Key,
        value: &[(Vec<u8>, f64)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.put(key, Value::SortedSet(rank_order(value.to_vec())), ttl)
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        self.check_available()?;
        Ok(self.live(key, |_| ()).is_some())
    }

    async fn apply_ttl(&self, key: &Key, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(e) if !e.is_expired(now) => {
                e.expires_at = Some(now + ttl);
                Ok(())
            }
            _ => Err(MigrateError::transfer(key.to_string(), "PEXPIRE on missing key")),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
