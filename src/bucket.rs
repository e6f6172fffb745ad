//! Token bucket engine: per-key buckets, the global sentinel bucket, and
//! idle eviction.
//!
//! Capacity is the burst allowance and the refill rate is the sustained
//! allowance; a client that idles can spend a full burst instantly and is
//! then throttled to the refill rate. That distinction is the point of a
//! token bucket over a fixed window and is preserved exactly.

use crate::clock::Clock;
use crate::config::{ConfigError, EndpointLimit, RateLimitConfig};
use crate::key::RateKey;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outcome of a consume attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumption {
    /// Whether enough tokens were available.
    pub allowed: bool,
    /// How long until `cost` tokens will have refilled. Zero when allowed.
    pub retry_after: Duration,
    /// Tokens left in the bucket after this attempt.
    pub remaining: f64,
}

/// Per-key token bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill_millis: u64,
    last_seen_millis: u64,
}

impl TokenBucket {
    fn full(limit: EndpointLimit, now_millis: u64) -> Self {
        Self {
            capacity: limit.burst_capacity,
            tokens: limit.burst_capacity,
            refill_per_sec: limit.rate_per_second,
            last_refill_millis: now_millis,
            last_seen_millis: now_millis,
        }
    }

    /// Lazy refill: `elapsed * rate`, capped at capacity.
    fn refill(&mut self, now_millis: u64) {
        let elapsed_secs = now_millis.saturating_sub(self.last_refill_millis) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        self.last_refill_millis = now_millis;
    }

    /// Refill then consume. A denied attempt leaves `tokens` untouched.
    fn try_consume(&mut self, cost: f64, now_millis: u64) -> Consumption {
        self.refill(now_millis);
        self.last_seen_millis = now_millis;

        if self.tokens >= cost {
            self.tokens -= cost;
            Consumption { allowed: true, retry_after: Duration::ZERO, remaining: self.tokens }
        } else {
            let missing = cost - self.tokens;
            Consumption {
                allowed: false,
                retry_after: Duration::from_secs_f64(missing / self.refill_per_sec),
                remaining: self.tokens,
            }
        }
    }
}

/// Endpoint overrides compiled once at startup: longest prefix wins, so the
/// list is kept sorted by descending prefix length and scanned in order.
#[derive(Debug, Default)]
struct OverrideTable {
    prefixes: Vec<(String, EndpointLimit)>,
}

impl OverrideTable {
    fn compile(overrides: &[(String, EndpointLimit)]) -> Self {
        let mut prefixes = overrides.to_vec();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { prefixes }
    }

    fn resolve(&self, path: &str) -> Option<(&str, EndpointLimit)> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(prefix, limit)| (prefix.as_str(), *limit))
    }
}

/// Concurrent table of token buckets keyed by [`RateKey`].
///
/// Buckets are created on first observation of a key and evicted after the
/// idle window; recreating one resets it to full capacity. That refund is an
/// accepted trade-off for bounded memory, not a bug.
#[derive(Debug)]
pub struct BucketTable {
    buckets: DashMap<RateKey, TokenBucket>,
    overrides: ArcSwap<OverrideTable>,
    default_limit: EndpointLimit,
    global_limit: EndpointLimit,
    idle_window: Duration,
    clock: Arc<dyn Clock>,
}

impl BucketTable {
    /// Build the table from validated configuration.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            buckets: DashMap::new(),
            overrides: ArcSwap::from_pointee(OverrideTable::compile(&config.endpoint_overrides)),
            default_limit: EndpointLimit {
                rate_per_second: config.per_client_rate_per_second,
                burst_capacity: config.burst_capacity,
            },
            global_limit: EndpointLimit {
                rate_per_second: config.global_rate_per_second,
                burst_capacity: config.global_burst_capacity,
            },
            idle_window: config.idle_eviction_window,
            clock,
        })
    }

    /// Consume from a client's bucket, honoring endpoint overrides.
    ///
    /// When an override prefix matches the path, the bucket is scoped to
    /// client+prefix with the override's limits; otherwise the client's
    /// default bucket applies. Most-specific prefix wins.
    pub fn consume_client(&self, addr: &str, path: &str, cost: f64) -> Consumption {
        let overrides = self.overrides.load();
        let (key, limit) = match overrides.resolve(path) {
            Some((prefix, limit)) => (RateKey::endpoint(addr, prefix), limit),
            None => (RateKey::client(addr), self.default_limit),
        };
        self.consume(&key, limit, cost)
    }

    /// Consume from the aggregate bucket shared by all clients.
    pub fn consume_global(&self, cost: f64) -> Consumption {
        self.consume(&RateKey::global(), self.global_limit, cost)
    }

    /// Locate-or-create the bucket for `key` and atomically refill+consume.
    ///
    /// The dashmap entry holds the shard lock for the whole mutation, so two
    /// concurrent consumes on one key never both succeed on a single token.
    /// Live override updates apply to buckets created afterwards; existing
    /// buckets keep their creation-time limits until idle-evicted.
    fn consume(&self, key: &RateKey, limit: EndpointLimit, cost: f64) -> Consumption {
        let now = self.clock.now_millis();
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::full(limit, now));
        bucket.try_consume(cost, now)
    }

    /// Replace the endpoint override table. Reads stay lock-free.
    pub fn update_overrides(
        &self,
        overrides: &[(String, EndpointLimit)],
    ) -> Result<(), ConfigError> {
        for (prefix, limit) in overrides {
            if prefix.is_empty() || !prefix.starts_with('/') {
                return Err(ConfigError::InvalidPrefix { provided: prefix.clone() });
            }
            let probe = RateLimitConfig {
                endpoint_overrides: vec![(prefix.clone(), *limit)],
                ..Default::default()
            };
            probe.validate()?;
        }
        self.overrides.store(Arc::new(OverrideTable::compile(overrides)));
        Ok(())
    }

    /// Drop buckets idle longer than the configured window. Runs on a timer;
    /// each removal holds only one shard lock briefly.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let cutoff = self.idle_window.as_millis() as u64;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_seen_millis) <= cutoff);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "evicted idle buckets");
        }
        evicted
    }

    /// Remove a single client's buckets (operator reset path).
    pub fn remove_client(&self, addr: &str) -> usize {
        let client = RateKey::client(addr);
        let before = self.buckets.len();
        self.buckets
            .retain(|key, _| key.is_global() || key.client_addr() != client.client_addr());
        before - self.buckets.len()
    }

    /// Number of live buckets, the global sentinel included.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no buckets exist yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Spawn the idle-eviction sweeper. The task exits when the table is
    /// dropped; it never holds locks request threads need beyond a single
    /// shard retain step.
    pub fn spawn_idle_eviction(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(table) => {
                        table.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
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

    fn table_with(config: RateLimitConfig, clock: ManualClock) -> BucketTable {
        BucketTable::new(&config, Arc::new(clock)).expect("valid config")
    }

    #[test]
    fn tokens_decrease_monotonically_and_never_go_negative() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            per_client_rate_per_second: 1.0,
            burst_capacity: 5.0,
            ..Default::default()
        };
        let table = table_with(config, clock);

        let mut last_remaining = f64::INFINITY;
        for _ in 0..5 {
            let c = table.consume_client("10.0.0.1", "/", 1.0);
            assert!(c.allowed);
            assert!(c.remaining < last_remaining);
            assert!(c.remaining >= 0.0);
            last_remaining = c.remaining;
        }

        // Sixth consume with no elapsed time is denied and mutates nothing.
        let denied = table.consume_client("10.0.0.1", "/", 1.0);
        assert!(!denied.allowed);
        assert!(denied.remaining >= 0.0);
        assert!(denied.retry_after >= Duration::from_millis(999));
    }

    #[test]
    fn refill_is_elapsed_times_rate_capped_at_capacity() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            per_client_rate_per_second: 30.0,
            burst_capacity: 60.0,
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock.clone())).unwrap();
        let handle = clock;

        // Drain the full burst.
        for _ in 0..60 {
            assert!(table.consume_client("10.0.0.1", "/", 1.0).allowed);
        }
        assert!(!table.consume_client("10.0.0.1", "/", 1.0).allowed);

        // Exactly one second: exactly 30 tokens refilled.
        handle.advance(1000);
        for _ in 0..30 {
            assert!(table.consume_client("10.0.0.1", "/", 1.0).allowed);
        }
        assert!(!table.consume_client("10.0.0.1", "/", 1.0).allowed);

        // A long idle refills to capacity, never past it.
        handle.advance(3_600_000);
        let c = table.consume_client("10.0.0.1", "/", 1.0);
        assert!(c.allowed);
        assert!((c.remaining - 59.0).abs() < 1e-9);
    }

    #[test]
    fn burst_then_sustained_throttle() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            per_client_rate_per_second: 1.0,
            burst_capacity: 10.0,
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock.clone())).unwrap();

        // Full burst spent instantly after idling.
        for _ in 0..10 {
            assert!(table.consume_client("c", "/", 1.0).allowed);
        }
        // Then throttled to the sustained rate.
        let denied = table.consume_client("c", "/", 1.0);
        assert!(!denied.allowed);
        assert!(denied.retry_after >= Duration::from_millis(999));
        clock.advance(1000);
        assert!(table.consume_client("c", "/", 1.0).allowed);
        assert!(!table.consume_client("c", "/", 1.0).allowed);
    }

    #[test]
    fn retry_after_reflects_missing_tokens() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            per_client_rate_per_second: 2.0,
            burst_capacity: 4.0,
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock)).unwrap();

        for _ in 0..4 {
            assert!(table.consume_client("c", "/", 1.0).allowed);
        }
        let denied = table.consume_client("c", "/", 1.0);
        // One token missing at 2/s: half a second.
        assert_eq!(denied.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn global_bucket_is_shared_across_clients() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            global_rate_per_second: 1.0,
            global_burst_capacity: 3.0,
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock)).unwrap();

        assert!(table.consume_global(1.0).allowed);
        assert!(table.consume_global(1.0).allowed);
        assert!(table.consume_global(1.0).allowed);
        assert!(!table.consume_global(1.0).allowed);
    }

    #[test]
    fn endpoint_override_longest_prefix_wins() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            endpoint_overrides: vec![
                (
                    "/api".to_string(),
                    EndpointLimit { rate_per_second: 10.0, burst_capacity: 10.0 },
                ),
                (
                    "/api/search".to_string(),
                    EndpointLimit { rate_per_second: 1.0, burst_capacity: 2.0 },
                ),
            ],
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock)).unwrap();

        // /api/search gets the tighter, more specific limit.
        assert!(table.consume_client("c", "/api/search?q=x", 1.0).allowed);
        assert!(table.consume_client("c", "/api/search?q=x", 1.0).allowed);
        assert!(!table.consume_client("c", "/api/search?q=x", 1.0).allowed);

        // /api/other still has headroom under the broader limit.
        assert!(table.consume_client("c", "/api/other", 1.0).allowed);
    }

    #[test]
    fn idle_buckets_are_evicted_and_recreated_full() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            per_client_rate_per_second: 1.0,
            burst_capacity: 2.0,
            idle_eviction_window: Duration::from_secs(60),
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock.clone())).unwrap();

        assert!(table.consume_client("c", "/", 2.0).allowed);
        assert!(!table.consume_client("c", "/", 1.0).allowed);
        assert_eq!(table.len(), 1);

        clock.advance(61_000);
        assert_eq!(table.evict_idle(), 1);
        assert!(table.is_empty());

        // Recreated at full capacity: documented trade-off of eviction.
        assert!(table.consume_client("c", "/", 2.0).allowed);
    }

    #[test]
    fn eviction_spares_active_buckets() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            idle_eviction_window: Duration::from_secs(60),
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock.clone())).unwrap();

        table.consume_client("idle", "/", 1.0);
        clock.advance(50_000);
        table.consume_client("active", "/", 1.0);
        clock.advance(20_000);

        assert_eq!(table.evict_idle(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_client_clears_default_and_endpoint_buckets() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            endpoint_overrides: vec![(
                "/api".to_string(),
                EndpointLimit { rate_per_second: 5.0, burst_capacity: 5.0 },
            )],
            ..Default::default()
        };
        let table = BucketTable::new(&config, Arc::new(clock)).unwrap();

        table.consume_client("c", "/", 1.0);
        table.consume_client("c", "/api/x", 1.0);
        table.consume_global(1.0);
        assert_eq!(table.len(), 3);

        assert_eq!(table.remove_client("c"), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_consumes_never_oversell() {
        let clock = MonotonicClock::default();
        let config = RateLimitConfig {
            per_client_rate_per_second: 0.001,
            burst_capacity: 5.0,
            ..Default::default()
        };
        let table = Arc::new(BucketTable::new(&config, Arc::new(clock)).unwrap());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                table.consume_client("c", "/", 1.0).allowed
            }));
        }
        let allowed = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, 5, "exactly the burst capacity may succeed");
    }
}
