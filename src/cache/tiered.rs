//! Tiered cache façade: primary store with a transparent in-process fallback.
//!
//! Callers work with typed values; the façade owns key prefixing, TTL
//! clamping, serialization, and compression, then routes the raw bytes to
//! the primary tier when it is attached and healthy, or to the fallback
//! otherwise. A primary failure mid-operation retries the same operation on
//! the fallback, so callers only ever see `Unavailable` when both tiers are
//! gone (the fallback never is).
//!
//! Value envelope: one flags byte, then the payload. Bit 0 marks a gzipped
//! payload, bit 1 marks a bincode payload (used when a value cannot be
//! represented as JSON). Counters bypass the envelope and live as ASCII
//! decimal, the representation both tiers share.

use super::fallback::MemoryStore;
use super::primary::RedisStore;
use super::store::{CacheError, CacheStore};
use crate::config::{CacheConfig, ConfigError};
use arc_swap::ArcSwapOption;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_BINCODE: u8 = 0b10;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Values written.
    pub sets: u64,
    /// Primary-tier operations that failed over to the fallback.
    pub primary_failures: u64,
    /// Whether a primary store is configured at all.
    pub primary_configured: bool,
    /// Last known primary health (false when unconfigured).
    pub primary_healthy: bool,
    /// Entries currently held by the fallback tier.
    pub fallback_entries: usize,
}

/// Typed cache over a primary store and a bounded in-process fallback.
#[derive(Debug)]
pub struct TieredCache {
    primary: ArcSwapOption<RedisStore>,
    fallback: Arc<MemoryStore>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    primary_failures: AtomicU64,
    maintenance_started: AtomicBool,
}

impl TieredCache {
    /// Build the cache and try to attach the primary store. A primary that
    /// cannot be reached is not fatal: the cache starts on the fallback and
    /// the maintenance task keeps retrying the connection. Must be called
    /// from within a Tokio runtime.
    pub async fn connect(config: CacheConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let fallback = Arc::new(MemoryStore::new(config.fallback_capacity));
        let cache = Arc::new(Self {
            primary: ArcSwapOption::empty(),
            fallback,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            primary_failures: AtomicU64::new(0),
            maintenance_started: AtomicBool::new(false),
        });
        if let Some(url) = cache.config.primary_store_url.clone() {
            match RedisStore::connect(&url, cache.config.op_timeout).await {
                Ok(store) => cache.primary.store(Some(Arc::new(store))),
                Err(e) => {
                    tracing::warn!(error = %e, "primary cache unreachable; starting on fallback")
                }
            }
        }
        cache.start_maintenance();
        Ok(cache)
    }

    fn start_maintenance(self: &Arc<Self>) {
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fallback.spawn_sweep(self.config.cleanup_interval);
        let interval = self.config.ping_interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.probe_primary().await,
                    None => break,
                }
            }
        });
    }

    /// Keep the primary attached and its health flag fresh. Ping outcomes
    /// update the flag inside the store; a store that was never reachable is
    /// retried from scratch.
    async fn probe_primary(&self) {
        if let Some(primary) = self.primary.load_full() {
            let _ = primary.ping().await;
        } else if let Some(url) = &self.config.primary_store_url {
            match RedisStore::connect(url, self.config.op_timeout).await {
                Ok(store) => self.primary.store(Some(Arc::new(store))),
                Err(e) => tracing::debug!(error = %e, "primary cache still unreachable"),
            }
        }
    }

    fn primary_if_healthy(&self) -> Option<Arc<RedisStore>> {
        let primary = self.primary.load_full()?;
        primary.is_healthy().then_some(primary)
    }

    fn note_failover(&self, op: &str, error: &CacheError) {
        self.primary_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, error = %error, "primary cache failed; using fallback");
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn clamp_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.config.default_ttl).min(self.config.max_ttl)
    }

    // Raw routing. Each op runs on the healthy primary when there is one and
    // falls back on Unavailable; command-level errors surface unchanged.

    async fn route_get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.get(key).await {
                Err(e) if e.is_unavailable() => self.note_failover("get", &e),
                other => return other,
            }
        }
        self.fallback.get(key).await
    }

    async fn route_set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.set(key, value.clone(), ttl).await {
                Err(e) if e.is_unavailable() => self.note_failover("set", &e),
                other => return other,
            }
        }
        self.fallback.set(key, value, ttl).await
    }

    async fn route_delete(&self, key: &str) -> Result<bool, CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.delete(key).await {
                Err(e) if e.is_unavailable() => self.note_failover("delete", &e),
                other => return other,
            }
        }
        self.fallback.delete(key).await
    }

    async fn route_multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.multi_get(keys).await {
                Err(e) if e.is_unavailable() => self.note_failover("multi_get", &e),
                other => return other,
            }
        }
        self.fallback.multi_get(keys).await
    }

    async fn route_multi_set(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.multi_set(entries.clone(), ttl).await {
                Err(e) if e.is_unavailable() => self.note_failover("multi_set", &e),
                other => return other,
            }
        }
        self.fallback.multi_set(entries, ttl).await
    }

    async fn route_increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, CacheError> {
        if let Some(primary) = self.primary_if_healthy() {
            match primary.increment(key, delta, ttl).await {
                Err(e) if e.is_unavailable() => self.note_failover("increment", &e),
                other => return other,
            }
        }
        self.fallback.increment(key, delta, ttl).await
    }

    async fn route_delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        // Invalidation must reach both tiers or stale fallback entries would
        // resurface after a primary outage.
        let mut removed = 0;
        if let Some(primary) = self.primary_if_healthy() {
            match primary.delete_by_pattern(pattern).await {
                Err(e) if e.is_unavailable() => self.note_failover("delete_by_pattern", &e),
                Err(e) => return Err(e),
                Ok(n) => removed += n,
            }
        }
        removed += self.fallback.delete_by_pattern(pattern).await?;
        Ok(removed)
    }

    // Typed surface.

    /// Fetch and decode a value. `Ok(None)` is a miss; decode failures
    /// surface as [`CacheError::Serialization`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let full = self.full_key(key);
        match self.route_get(&full).await? {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                decode(key, &bytes).map(Some)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Encode and store a value. `None` TTL means the configured default;
    /// anything above the maximum is clamped down.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = encode(key, value, self.config.compression_threshold_bytes)?;
        let full = self.full_key(key);
        self.route_set(&full, bytes, self.clamp_ttl(ttl)).await?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a key. Returns whether it existed in the tier that served the
    /// call.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let full = self.full_key(key);
        self.route_delete(&full).await
    }

    /// Fetch several values in one round trip, preserving order.
    pub async fn multi_get<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> Result<Vec<Option<T>>, CacheError> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let raw = self.route_multi_get(&full).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (key, bytes) in keys.iter().zip(raw) {
            match bytes {
                Some(bytes) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    out.push(Some(decode(key, &bytes)?));
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    /// Store several values in one round trip, all with the same TTL.
    pub async fn multi_set<T: Serialize>(
        &self,
        entries: &[(&str, T)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            encoded.push((
                self.full_key(key),
                encode(key, value, self.config.compression_threshold_bytes)?,
            ));
        }
        self.route_multi_set(encoded, self.clamp_ttl(ttl)).await?;
        self.sets.fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Add `delta` to a counter, creating it at zero, and refresh its TTL.
    pub async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        let full = self.full_key(key);
        self.route_increment(&full, delta, self.clamp_ttl(ttl)).await
    }

    /// Delete every key matching `pattern` (unprefixed, `*` wildcard) in
    /// both tiers. Returns the number removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let full = self.full_key(pattern);
        self.route_delete_by_pattern(&full).await
    }

    /// Drop everything under this cache's key prefix.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        self.delete_by_pattern("*").await
    }

    /// Memoize a computation. Cache read failures are logged and treated as
    /// misses so a degraded cache never fails the computation; write
    /// failures are logged and the computed value is returned anyway.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => tracing::warn!(key, error = %e, "cache read failed; recomputing"),
        }
        let value = compute().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            tracing::warn!(key, error = %e, "failed to cache computed value");
        }
        Ok(value)
    }

    /// Snapshot the cache's counters and tier state.
    pub fn stats(&self) -> CacheStats {
        let primary = self.primary.load_full();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            primary_failures: self.primary_failures.load(Ordering::Relaxed),
            primary_configured: self.config.primary_store_url.is_some(),
            primary_healthy: primary.is_some_and(|p| p.is_healthy()),
            fallback_entries: self.fallback.len(),
        }
    }
}

fn encode<T: Serialize>(
    key: &str,
    value: &T,
    compression_threshold: usize,
) -> Result<Vec<u8>, CacheError> {
    let (payload, mut flags) = match serde_json::to_vec(value) {
        Ok(bytes) => (bytes, 0u8),
        // Values JSON cannot represent (non-string map keys, raw byte keys)
        // go through bincode instead.
        Err(json_err) => match bincode::serialize(value) {
            Ok(bytes) => (bytes, FLAG_BINCODE),
            Err(bin_err) => {
                return Err(CacheError::Serialization {
                    key: key.to_string(),
                    message: format!("json: {}; bincode: {}", json_err, bin_err),
                });
            }
        },
    };

    let payload = if payload.len() > compression_threshold {
        flags |= FLAG_COMPRESSED;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&payload)
            .and_then(|_| encoder.finish())
            .map_err(|e| CacheError::Serialization {
                key: key.to_string(),
                message: format!("compression failed: {}", e),
            })?
    } else {
        payload
    };

    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(flags);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, CacheError> {
    let (flags, payload) = bytes.split_first().ok_or_else(|| CacheError::Serialization {
        key: key.to_string(),
        message: "empty cache entry".to_string(),
    })?;

    let payload: Vec<u8> = if flags & FLAG_COMPRESSED != 0 {
        let mut decoder = flate2::read::GzDecoder::new(payload);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: format!("decompression failed: {}", e),
        })?;
        out
    } else {
        payload.to_vec()
    };

    if flags & FLAG_BINCODE != 0 {
        bincode::deserialize(&payload).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: format!("bincode: {}", e),
        })
    } else {
        serde_json::from_slice(&payload).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: format!("json: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    fn config() -> CacheConfig {
        CacheConfig { primary_store_url: None, ..CacheConfig::default() }
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let cache = TieredCache::connect(config()).await.unwrap();

        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Payload {
            name: String,
            count: u32,
        }

        let value = Payload { name: "widget".into(), count: 7 };
        cache.set("p", &value, None).await.unwrap();
        assert_eq!(cache.get::<Payload>("p").await.unwrap(), Some(value));
        assert_eq!(cache.get::<Payload>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn large_values_compress_and_round_trip_exactly() {
        let cfg = CacheConfig { compression_threshold_bytes: 64, ..config() };
        let prefix = cfg.key_prefix.clone();
        let cache = TieredCache::connect(cfg).await.unwrap();

        let value = "abcdefgh".repeat(512);
        cache.set("big", &value, None).await.unwrap();

        // Raw envelope in the fallback tier: compression flag on, payload
        // smaller than the JSON text.
        let raw = cache.fallback.get(&format!("{}big", prefix)).await.unwrap().unwrap();
        assert_eq!(raw[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(raw.len() < value.len());

        assert_eq!(cache.get::<String>("big").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn small_values_skip_compression() {
        let cache = TieredCache::connect(config()).await.unwrap();
        cache.set("small", &"tiny", None).await.unwrap();
        let raw = cache.fallback.get("tollgate:small").await.unwrap().unwrap();
        assert_eq!(raw[0], 0);
    }

    #[tokio::test]
    async fn json_unfriendly_values_take_the_binary_path() {
        let cache = TieredCache::connect(config()).await.unwrap();

        // Tuple map keys cannot be JSON object keys.
        let mut value: BTreeMap<(u32, u32), String> = BTreeMap::new();
        value.insert((1, 2), "a".into());
        value.insert((3, 4), "b".into());

        cache.set("bin", &value, None).await.unwrap();
        let raw = cache.fallback.get("tollgate:bin").await.unwrap().unwrap();
        assert_eq!(raw[0] & FLAG_BINCODE, FLAG_BINCODE);
        assert_eq!(
            cache.get::<BTreeMap<(u32, u32), String>>("bin").await.unwrap(),
            Some(value)
        );
    }

    #[tokio::test]
    async fn get_or_compute_memoizes() {
        let cache = TieredCache::connect(config()).await.unwrap();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value: u32 = cache
                .get_or_compute("answer", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_compute_propagates_compute_errors() {
        let cache = TieredCache::connect(config()).await.unwrap();
        let result: Result<u32, &str> = cache
            .get_or_compute("nope", None, || async { Err("compute failed") })
            .await;
        assert_eq!(result, Err("compute failed"));
        // Nothing was cached.
        assert_eq!(cache.get::<u32>("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let cache = TieredCache::connect(config()).await.unwrap();
        assert_eq!(cache.increment("seen", 1, None).await.unwrap(), 1);
        assert_eq!(cache.increment("seen", 9, None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn pattern_delete_and_clear_are_prefix_scoped() {
        let cache = TieredCache::connect(config()).await.unwrap();
        cache.set("user:1", &"a", None).await.unwrap();
        cache.set("user:2", &"b", None).await.unwrap();
        cache.set("other", &"c", None).await.unwrap();

        assert_eq!(cache.delete_by_pattern("user:*").await.unwrap(), 2);
        assert_eq!(cache.get::<String>("other").await.unwrap(), Some("c".into()));

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.get::<String>("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_ops_preserve_order() {
        let cache = TieredCache::connect(config()).await.unwrap();
        cache.multi_set(&[("a", 1u32), ("c", 3u32)], None).await.unwrap();
        let out = cache.multi_get::<u32>(&["a", "b", "c"]).await.unwrap();
        assert_eq!(out, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn stats_reflect_traffic_and_tier_state() {
        let cache = TieredCache::connect(config()).await.unwrap();
        cache.set("k", &1u32, None).await.unwrap();
        cache.get::<u32>("k").await.unwrap();
        cache.get::<u32>("absent").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(!stats.primary_configured);
        assert!(!stats.primary_healthy);
        assert_eq!(stats.fallback_entries, 1);
        assert_eq!(stats.primary_failures, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = CacheConfig { fallback_capacity: 0, ..config() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn decode_rejects_empty_and_garbage() {
        assert!(decode::<u32>("k", &[]).is_err());
        assert!(decode::<u32>("k", &[0, b'x']).is_err());
    }
}
