//! Redis-compatible primary cache tier.
//!
//! Every operation runs under the configured timeout against a shared
//! [`ConnectionManager`], which reconnects on its own. A connection-level
//! failure flips the health flag so the façade stops routing here until a
//! ping succeeds again; command-level errors (wrong type, protocol) do not.

use super::store::{CacheError, CacheStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SCAN_BATCH: usize = 100;

/// Primary store backed by a Redis-protocol server.
pub struct RedisStore {
    manager: ConnectionManager,
    healthy: AtomicBool,
    op_timeout: Duration,
    url: String,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers a PING.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Unavailable(format!("invalid cache url: {}", e)))?;
        // A black-holed address would otherwise hold the reconnect probe
        // for the OS connect timeout; bound it like every other operation.
        let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CacheError::Unavailable(format!("connect timed out after {:?}", op_timeout))
            })?
            .map_err(|e| CacheError::Unavailable(format!("connect failed: {}", e)))?;

        let store = Self {
            manager,
            healthy: AtomicBool::new(true),
            op_timeout,
            url: url.to_string(),
        };
        store.ping_inner().await?;
        tracing::info!(url, "connected to primary cache");
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            tracing::warn!(url = %self.url, "primary cache marked unhealthy");
        }
    }

    fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::SeqCst) {
            tracing::info!(url = %self.url, "primary cache recovered");
        }
    }

    /// Run one command future under the operation timeout, folding transport
    /// failures into `Unavailable` and flipping the health flag.
    async fn run<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => {
                self.mark_healthy();
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
                {
                    self.mark_unhealthy();
                    Err(CacheError::Unavailable(e.to_string()))
                } else {
                    Err(CacheError::Backend(e.to_string()))
                }
            }
            Err(_) => {
                self.mark_unhealthy();
                Err(CacheError::Unavailable(format!(
                    "operation timed out after {:?}",
                    self.op_timeout
                )))
            }
        }
    }

    async fn ping_inner(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        self.run(async move { redis::cmd("PING").query_async::<String>(&mut conn).await })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn();
        self.run(async move {
            redis::cmd("GET").arg(key).query_async::<Option<Vec<u8>>>(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        self.run(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(secs)
                .query_async::<String>(&mut conn)
                .await
        })
        .await
        .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let removed = self
            .run(async move { redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        self.run(async move {
            redis::cmd("MGET").arg(keys).query_async::<Vec<Option<Vec<u8>>>>(&mut conn).await
        })
        .await
    }

    async fn multi_set(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        self.run(async move {
            let mut pipe = redis::pipe();
            for (key, value) in entries {
                pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(secs).ignore();
            }
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn();
        let secs = ttl.as_secs().max(1);
        let (value, _): (i64, i64) = self
            .run(async move {
                redis::pipe()
                    .cmd("INCRBY")
                    .arg(key)
                    .arg(delta)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(secs)
                    .query_async::<(i64, i64)>(&mut conn)
                    .await
            })
            .await?;
        Ok(value)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn();
        self.run(async move {
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async::<(u64, Vec<String>)>(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    removed +=
                        redis::cmd("DEL").arg(&keys).query_async::<u64>(&mut conn).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(removed)
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.ping_inner().await
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "primary"
    }
}
