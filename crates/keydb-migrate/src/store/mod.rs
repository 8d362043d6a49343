//! Store abstraction shared by the enumerator, transfer engine and validator.
//!
//! - [`StoreClient`]: capability surface required of both source and destination
//! - [`RedisStore`]: pooled KeyDB/Redis implementation
//! - [`MemoryStore`]: in-process implementation used by tests and dry runs

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisConnectionManager, RedisStore};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Opaque binary key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Value category as reported by the store's TYPE command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    String,
    Hash,
    List,
    Set,
    SortedSet,
    /// Key does not exist.
    None,
    /// Any type the migrator cannot transfer (stream, module types, ...).
    Other(String),
}

impl KeyType {
    /// Parse a TYPE reply.
    pub fn parse(name: &str) -> Self {
        match name {
            "string" => KeyType::String,
            "hash" => KeyType::Hash,
            "list" => KeyType::List,
            "set" => KeyType::Set,
            "zset" => KeyType::SortedSet,
            "none" => KeyType::None,
            other => KeyType::Other(other.to_string()),
        }
    }

    /// Wire name, as TYPE would report it.
    pub fn as_str(&self) -> &str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::SortedSet => "zset",
            KeyType::None => "none",
            KeyType::Other(name) => name,
        }
    }

    /// Whether a transfer routine exists for this type.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            KeyType::String | KeyType::Hash | KeyType::List | KeyType::Set | KeyType::SortedSet
        )
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type HashValue = HashMap<Vec<u8>, Vec<u8>>;
pub type SetValue = HashSet<Vec<u8>>;
/// Members with scores, in the store's rank order.
pub type SortedSetValue = Vec<(Vec<u8>, f64)>;

/// Full value of one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Vec<u8>),
    Hash(HashValue),
    List(Vec<Vec<u8>>),
    Set(SetValue),
    SortedSet(SortedSetValue),
}

impl Value {
    pub fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::Hash(_) => KeyType::Hash,
            Value::List(_) => KeyType::List,
            Value::Set(_) => KeyType::Set,
            Value::SortedSet(_) => KeyType::SortedSet,
        }
    }

    /// Element count (byte length for strings).
    pub fn len(&self) -> usize {
        match self {
            Value::String(v) => v.len(),
            Value::Hash(v) => v.len(),
            Value::List(v) => v.len(),
            Value::Set(v) => v.len(),
            Value::SortedSet(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability surface required of both source and destination handles.
///
/// Collection getters return an empty collection for a missing key, matching
/// the store protocol. Setters replace any existing value for the key.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Label for logs (endpoint, never credentials).
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// One SCAN round trip. Returns the page and the next cursor (0 when done).
    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize)
        -> Result<(Vec<Key>, u64)>;

    async fn type_of(&self, key: &Key) -> Result<KeyType>;

    /// Remaining lifetime; `None` for persistent or missing keys.
    async fn remaining_ttl(&self, key: &Key) -> Result<Option<Duration>>;

    async fn get_string(&self, key: &Key) -> Result<Option<Vec<u8>>>;
    async fn get_hash(&self, key: &Key) -> Result<HashValue>;
    async fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>>;
    async fn get_set(&self, key: &Key) -> Result<SetValue>;
    async fn get_sorted_set(&self, key: &Key) -> Result<SortedSetValue>;

    async fn set_string(&self, key: &Key, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    async fn set_hash(&self, key: &Key, value: &HashValue, ttl: Option<Duration>) -> Result<()>;
    async fn set_list(&self, key: &Key, value: &[Vec<u8>], ttl: Option<Duration>) -> Result<()>;
    async fn set_set(&self, key: &Key, value: &SetValue, ttl: Option<Duration>) -> Result<()>;
    async fn set_sorted_set(
        &self,
        key: &Key,
        value: &[(Vec<u8>, f64)],
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn exists(&self, key: &Key) -> Result<bool>;

    async fn apply_ttl(&self, key: &Key, ttl: Duration) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Read the full value of `key` as `key_type`.
    ///
    /// `Ok(None)` means the key is gone (nil string or empty collection) or the
    /// type has no transfer routine.
    async fn read_value(&self, key: &Key, key_type: &KeyType) -> Result<Option<Value>> {
        let value = match key_type {
            KeyType::String => self.get_string(key).await?.map(Value::String),
            KeyType::Hash => Some(Value::Hash(self.get_hash(key).await?)),
            KeyType::List => Some(Value::List(self.get_list(key).await?)),
            KeyType::Set => Some(Value::Set(self.get_set(key).await?)),
            KeyType::SortedSet => Some(Value::SortedSet(self.get_sorted_set(key).await?)),
            KeyType::None | KeyType::Other(_) => None,
        };
        Ok(value.filter(|v| matches!(v, Value::String(_)) || !v.is_empty()))
    }

    /// Write `value` with a single type-specific call.
    async fn write_value(&self, key: &Key, value: &Value, ttl: Option<Duration>) -> Result<()> {
        match value {
            Value::String(v) => self.set_string(key, v, ttl).await,
            Value::Hash(v) => self.set_hash(key, v, ttl).await,
            Value::List(v) => self.set_list(key, v, ttl).await,
            Value::Set(v) => self.set_set(key, v, ttl).await,
            Value::SortedSet(v) => self.set_sorted_set(key, v, ttl).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_parse_round_trip() {
        for name in ["string", "hash", "list", "set", "zset", "none"] {
            assert_eq!(KeyType::parse(name).as_str(), name);
        }
        assert_eq!(
            KeyType::parse("stream"),
            KeyType::Other("stream".to_string())
        );
        assert!(!KeyType::parse("stream").is_supported());
        assert!(!KeyType::None.is_supported());
        assert!(KeyType::SortedSet.is_supported());
    }

    #[test]
    fn test_key_display_is_lossy() {
        let key = Key::new(vec![b'a', 0xff, b'b']);
        assert_eq!(key.to_string(), "a\u{fffd}b");
        assert_eq!(key.as_bytes(), &[b'a', 0xff, b'b']);
    }

    #[test]
    fn test_empty_string_value_is_not_empty_collection() {
        let value = Value::String(Vec::new());
        assert!(value.is_empty());
        assert_eq!(value.key_type(), KeyType::String);
    }
}
