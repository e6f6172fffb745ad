//! Bounded in-process fallback tier.
//!
//! A mutex-guarded map with lazy expiry and approximate-LRU eviction. The
//! recency queue records every touch; stale queue slots are skipped during
//! eviction by comparing touch ids and compacted away once they outnumber
//! live entries, keeping each operation amortized O(1) without a linked
//! list and the queue proportional to the map.

use super::store::{glob_match, CacheError, CacheStore};
use crate::clock::{Clock, MonotonicClock};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at_millis: u64,
    touch_id: u64,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Slot>,
    recency: VecDeque<(String, u64)>,
    next_touch: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) -> u64 {
        // Re-touching leaves the previous queue slot behind as a stale
        // entry; compact before the push so a read-heavy workload cannot
        // grow the queue past twice the live map between sweeps. Running
        // before the push also keeps the slot being issued out of the
        // retain, which would otherwise drop it while its entry still
        // carries the old touch id.
        if self.recency.len() >= self.map.len().saturating_add(1).saturating_mul(2) {
            let Inner { map, recency, .. } = self;
            recency.retain(|(key, id)| map.get(key).is_some_and(|slot| slot.touch_id == *id));
        }
        let id = self.next_touch;
        self.next_touch += 1;
        self.recency.push_back((key.to_string(), id));
        id
    }

    /// Evict least-recently-touched entries until the map fits `capacity`.
    /// Queue slots whose touch id no longer matches the live entry are
    /// leftovers from later touches and are discarded without evicting.
    fn evict_to(&mut self, capacity: usize) {
        while self.map.len() > capacity {
            let Some((key, id)) = self.recency.pop_front() else {
                break;
            };
            let live = self.map.get(&key).is_some_and(|slot| slot.touch_id == id);
            if live {
                self.map.remove(&key);
                tracing::debug!(key = %key, "evicted fallback entry at capacity");
            }
        }
    }
}

/// In-memory store used when the primary tier is down or unconfigured.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(MonotonicClock::new()))
    }

    /// Create a store with an injected clock.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity: capacity.max(1), clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-operation; the map is still
        // structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expires_at(&self, ttl: Duration) -> u64 {
        self.clock.now_millis().saturating_add(ttl.as_millis() as u64)
    }

    /// Number of live entries, expired-but-unswept included.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Drop expired entries and compact the recency queue.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        let Inner { map, recency, .. } = &mut *inner;
        let before = map.len();
        map.retain(|_, slot| slot.expires_at_millis > now);
        recency.retain(|(key, id)| map.get(key).is_some_and(|slot| slot.touch_id == *id));
        let swept = before - map.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = map.len(), "swept expired fallback entries");
        }
        swept
    }

    /// Spawn the expiry sweeper; exits when the store is dropped.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.map.get(key) {
            Some(slot) if slot.expires_at_millis > now => {
                let value = slot.value.clone();
                let id = inner.touch(key);
                if let Some(slot) = inner.map.get_mut(key) {
                    slot.touch_id = id;
                }
                Ok(Some(value))
            }
            Some(_) => {
                inner.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at_millis = self.expires_at(ttl);
        let mut inner = self.lock();
        let touch_id = inner.touch(key);
        inner.map.insert(key.to_string(), Slot { value, expires_at_millis, touch_id });
        inner.evict_to(self.capacity);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock().map.remove(key).is_some())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn multi_set(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let now = self.clock.now_millis();
        let expires_at_millis = self.expires_at(ttl);
        let mut inner = self.lock();

        let current = match inner.map.get(key) {
            Some(slot) if slot.expires_at_millis > now => {
                let text = std::str::from_utf8(&slot.value)
                    .map_err(|_| CacheError::Backend("counter is not an integer".into()))?;
                text.parse::<i64>()
                    .map_err(|_| CacheError::Backend("counter is not an integer".into()))?
            }
            _ => 0,
        };
        let next = current.saturating_add(delta);
        let touch_id = inner.touch(key);
        inner.map.insert(
            key.to_string(),
            Slot { value: next.to_string().into_bytes(), expires_at_millis, touch_id },
        );
        inner.evict_to(self.capacity);
        Ok(next)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut inner = self.lock();
        let before = inner.map.len();
        inner.map.retain(|key, _| !glob_match(pattern, key));
        Ok((before - inner.map.len()) as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryStore::new(16);
        store.set("a", b"hello".to_vec(), ttl()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"hello".to_vec()));
        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let clock = ManualClock::new();
        let store = MemoryStore::with_clock(16, Arc::new(clock.clone()));
        store.set("a", b"v".to_vec(), Duration::from_secs(1)).await.unwrap();

        clock.advance(999);
        assert!(store.get("a").await.unwrap().is_some());
        clock.advance(1);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = MemoryStore::new(3);
        store.set("a", b"1".to_vec(), ttl()).await.unwrap();
        store.set("b", b"2".to_vec(), ttl()).await.unwrap();
        store.set("c", b"3".to_vec(), ttl()).await.unwrap();

        // Touch "a" so "b" becomes the oldest.
        store.get("a").await.unwrap();
        store.set("d", b"4".to_vec(), ttl()).await.unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("c").await.unwrap().is_some());
        assert!(store.get("d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_does_not_double_count() {
        let store = MemoryStore::new(2);
        store.set("a", b"1".to_vec(), ttl()).await.unwrap();
        store.set("a", b"2".to_vec(), ttl()).await.unwrap();
        store.set("b", b"3".to_vec(), ttl()).await.unwrap();

        // Both keys fit; the stale queue slot for "a" must not evict it.
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn read_heavy_traffic_keeps_recency_queue_bounded() {
        let store = MemoryStore::new(8);
        for i in 0..8 {
            store.set(&format!("k{}", i), b"v".to_vec(), ttl()).await.unwrap();
        }
        for i in 0..10_000 {
            store.get(&format!("k{}", i % 8)).await.unwrap();
        }

        // Every read re-touches, but the queue compacts instead of holding
        // one stale slot per operation until the next sweep.
        let queued = store.lock().recency.len();
        assert!(queued <= 18, "recency queue holds {} slots for 8 entries", queued);

        // Eviction order survives compaction: re-touch k0 so an
        // overflowing insert drops one of the others.
        store.get("k0").await.unwrap();
        store.set("k8", b"v".to_vec(), ttl()).await.unwrap();
        assert_eq!(store.len(), 8);
        assert!(store.get("k0").await.unwrap().is_some());
        assert!(store.get("k8").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn increment_creates_and_adds() {
        let store = MemoryStore::new(16);
        assert_eq!(store.increment("hits", 1, ttl()).await.unwrap(), 1);
        assert_eq!(store.increment("hits", 4, ttl()).await.unwrap(), 5);
        assert_eq!(store.increment("hits", -2, ttl()).await.unwrap(), 3);
        // Stored as ASCII decimal.
        assert_eq!(store.get("hits").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric_values() {
        let store = MemoryStore::new(16);
        store.set("k", b"not a number".to_vec(), ttl()).await.unwrap();
        let err = store.increment("k", 1, ttl()).await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
    }

    #[tokio::test]
    async fn delete_by_pattern_scopes_to_matches() {
        let store = MemoryStore::new(16);
        store.set("user:1", b"a".to_vec(), ttl()).await.unwrap();
        store.set("user:2", b"b".to_vec(), ttl()).await.unwrap();
        store.set("session:1", b"c".to_vec(), ttl()).await.unwrap();

        assert_eq!(store.delete_by_pattern("user:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("session:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_drops_expired_and_compacts_queue() {
        let clock = ManualClock::new();
        let store = MemoryStore::with_clock(16, Arc::new(clock.clone()));
        store.set("a", b"1".to_vec(), Duration::from_secs(1)).await.unwrap();
        store.set("b", b"2".to_vec(), Duration::from_secs(100)).await.unwrap();

        clock.advance(5_000);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn multi_get_preserves_order() {
        let store = MemoryStore::new(16);
        store
            .multi_set(
                vec![("a".into(), b"1".to_vec()), ("c".into(), b"3".to_vec())],
                ttl(),
            )
            .await
            .unwrap();
        let out = store
            .multi_get(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }
}
