//! KeyDB/Redis store with bb8 connection pooling.

use super::{HashValue, Key, KeyType, SetValue, SortedSetValue, StoreClient};
use crate::config::StoreConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use redis::aio::MultiplexedConnection;
use redis::{Client, Pipeline, RedisError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Connection manager for bb8 pool with redis multiplexed connections.
#[derive(Clone)]
pub struct RedisConnectionManager {
    client: Client,
}

impl RedisConnectionManager {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.connection_info())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl bb8::ManageConnection for RedisConnectionManager {
    type Connection = MultiplexedConnection;
    type Error = RedisError;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        redis::cmd("PING").query_async::<_, String>(conn).await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled KeyDB/Redis store.
///
/// Every call (pool checkout included) is bounded by the per-operation timeout.
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    name: String,
    op_timeout: Duration,
}

impl RedisStore {
    /// Create the pool and verify the store answers PING.
    pub async fn connect(config: &StoreConfig, op_timeout: Duration) -> Result<Self> {
        let endpoint = config.endpoint();
        let manager = RedisConnectionManager::new(config)?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(op_timeout)
            .build(manager)
            .await
            .map_err(|e| MigrateError::connection(&endpoint, e.to_string()))?;

        let store = Self {
            pool,
            name: endpoint.clone(),
            op_timeout,
        };

        store
            .ping()
            .await
            .map_err(|e| MigrateError::connection(&endpoint, e.to_string()))?;

        info!(
            "Connected to {} (pool_size={})",
            endpoint, config.pool_size
        );

        Ok(store)
    }

    /// Get a pooled connection.
    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), format!("checkout from {}", self.name)))
    }

    /// Run `fut` under the per-operation deadline.
    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout {
                operation: format!("{} on {}", operation, self.name),
                after: self.op_timeout,
            }),
        }
    }

    /// Execute a MULTI/EXEC block that replaces `key` with whatever `fill` adds.
    async fn replace<F>(&self, operation: &str, key: &Key, ttl: Option<Duration>, fill: F) -> Result<()>
    where
        F: FnOnce(&mut Pipeline),
    {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(key.as_bytes()).ignore();
        fill(&mut pipe);
        if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
            pipe.cmd("PEXPIRE")
                .arg(key.as_bytes())
                .arg(ttl.as_millis() as u64)
                .ignore();
        }

        self.timed(operation, async {
            let mut conn = self.conn().await?;
            pipe.query_async::<_, ()>(&mut *conn).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.timed("PING", async {
            let mut conn = self.conn().await?;
            redis::cmd("PING").query_async::<_, String>(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(Vec<Key>, u64)> {
        let (next, keys) = self
            .timed("SCAN", async {
                let mut conn = self.conn().await?;
                let page = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async::<_, (u64, Vec<Vec<u8>>)>(&mut *conn)
                    .await?;
                Ok(page)
            })
            .await?;
        debug!("{}: SCAN {} -> {} ({} keys)", self.name, cursor, next, keys.len());
        Ok((keys.into_iter().map(Key::from).collect(), next))
    }

    async fn type_of(&self, key: &Key) -> Result<KeyType> {
        let name = self
            .timed("TYPE", async {
                let mut conn = self.conn().await?;
                let name = redis::cmd("TYPE")
                    .arg(key.as_bytes())
                    .query_async::<_, String>(&mut *conn)
                    .await?;
                Ok(name)
            })
            .await?;
        Ok(KeyType::parse(&name))
    }

    async fn remaining_ttl(&self, key: &Key) -> Result<Option<Duration>> {
        // -2: missing, -1: no expiry
        let ms = self
            .timed("PTTL", async {
                let mut conn = self.conn().await?;
                let ms = redis::cmd("PTTL")
                    .arg(key.as_bytes())
                    .query_async::<_, i64>(&mut *conn)
                    .await?;
                Ok(ms)
            })
            .await?;
        Ok((ms > 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn get_string(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.timed("GET", async {
            let mut conn = self.conn().await?;
            let value = redis::cmd("GET")
                .arg(key.as_bytes())
                .query_async::<_, Option<Vec<u8>>>(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn get_hash(&self, key: &Key) -> Result<HashValue> {
        self.timed("HGETALL", async {
            let mut conn = self.conn().await?;
            let value = redis::cmd("HGETALL")
                .arg(key.as_bytes())
                .query_async::<_, HashValue>(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        self.timed("LRANGE", async {
            let mut conn = self.conn().await?;
            let value = redis::cmd("LRANGE")
                .arg(key.as_bytes())
                .arg(0)
                .arg(-1)
                .query_async::<_, Vec<Vec<u8>>>(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn get_set(&self, key: &Key) -> Result<SetValue> {
        self.timed("SMEMBERS", async {
            let mut conn = self.conn().await?;
            let value = redis::cmd("SMEMBERS")
                .arg(key.as_bytes())
                .query_async::<_, SetValue>(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn get_sorted_set(&self, key: &Key) -> Result<SortedSetValue> {
        self.timed("ZRANGE", async {
            let mut conn = self.conn().await?;
            let value = redis::cmd("ZRANGE")
                .arg(key.as_bytes())
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async::<_, SortedSetValue>(&mut *conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn set_string(&self, key: &Key, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.replace("SET", key, ttl, |pipe| {
            pipe.cmd("SET").arg(key.as_bytes()).arg(value).ignore();
        })
        .await
    }

    async fn set_hash(&self, key: &Key, value: &HashValue, ttl: Option<Duration>) -> Result<()> {
        if value.is_empty() {
            return Err(MigrateError::transfer(key.to_string(), "empty hash"));
        }
        self.replace("HSET", key, ttl, |pipe| {
            let cmd = pipe.cmd("HSET").arg(key.as_bytes());
            for (field, v) in value {
                cmd.arg(field.as_slice()).arg(v.as_slice());
            }
            cmd.ignore();
        })
        .await
    }

    async fn set_list(&self, key: &Key, value: &[Vec<u8>], ttl: Option<Duration>) -> Result<()> {
        if value.is_empty() {
            return Err(MigrateError::transfer(key.to_string(), "empty list"));
        }
        self.replace("RPUSH", key, ttl, |pipe| {
            let cmd = pipe.cmd("RPUSH").arg(key.as_bytes());
            for element in value {
                cmd.arg(element.as_slice());
            }
            cmd.ignore();
        })
        .await
    }

    async fn set_set(&self, key: &Key, value: &SetValue, ttl: Option<Duration>) -> Result<()> {
        if value.is_empty() {
            return Err(MigrateError::transfer(key.to_string(), "empty set"));
        }
        self.replace("SADD", key, ttl, |pipe| {
            let cmd = pipe.cmd("SADD").arg(key.as_bytes());
            for member in value {
                cmd.arg(member.as_slice());
            }
            cmd.ignore();
        })
        .await
    }

    async fn set_sorted_set(
        &self,
        key: &Key,
        value: &[(Vec<u8>, f64)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if value.is_empty() {
            return Err(MigrateError::transfer(key.to_string(), "empty sorted set"));
        }
        self.replace("ZADD", key, ttl, |pipe| {
            let cmd = pipe.cmd("ZADD").arg(key.as_bytes());
            for (member, score) in value {
                cmd.arg(*score).arg(member.as_slice());
            }
            cmd.ignore();
        })
        .await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        self.timed("EXISTS", async {
            let mut conn = self.conn().await?;
            let n = redis::cmd("EXISTS")
                .arg(key.as_bytes())
                .query_async::<_, i64>(&mut *conn)
                .await?;
            Ok(n > 0)
        })
        .await
    }

    async fn apply_ttl(&self, key: &Key, ttl: Duration) -> Result<()> {
        self.timed("PEXPIRE", async {
            let mut conn = self.conn().await?;
            let applied = redis::cmd("PEXPIRE")
                .arg(key.as_bytes())
                .arg(ttl.as_millis() as u64)
                .query_async::<_, i64>(&mut *conn)
                .await?;
            if applied == 0 {
                return Err(MigrateError::transfer(
                    key.to_string(),
                    "PEXPIRE on missing key",
                ));
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // bb8 drops idle connections with the pool
        debug!("Closing pool for {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_builds_without_connecting() {
        let config = StoreConfig {
            host: "keydb.invalid".to_string(),
            password: "secret".to_string(),
            database: 3,
            ..StoreConfig::default()
        };
        assert!(RedisConnectionManager::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_connection_error() {
        let config = StoreConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..StoreConfig::default()
        };
        let err = RedisStore::connect(&config, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MigrateError::Connection { .. }));
    }
}
