//! Top-level rate limiter combining buckets, detection, and the block list.
//!
//! The evaluation order on every request is fixed: whitelist, block list,
//! global bucket, per-client bucket. Whitelisted traffic bypasses everything
//! and is never fed to the detector; every other request is observed, allowed
//! or not, so abuse signals see the full picture.

use crate::blocklist::{BlockEntry, BlockList};
use crate::bucket::BucketTable;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, DetectorConfig, EndpointLimit, RateLimitConfig};
use crate::detector::{AbuseDetector, BlockReason, RequestEvent};
use crate::key::{RateKey, Whitelist};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tokens left in the client's bucket. Infinite for whitelisted
        /// callers.
        remaining: f64,
    },
    /// The request must be refused.
    Denied {
        /// How long the caller should wait before retrying.
        wait: Duration,
        /// Set when the refusal came from a block rather than an empty
        /// bucket.
        reason: Option<BlockReason>,
    },
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Suggested wait before retrying, if denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Denied { wait, .. } => Some(*wait),
            Self::Allowed { .. } => None,
        }
    }

    /// `Retry-After` header value in whole seconds, rounded up so a retry
    /// at the stated time cannot land early.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|wait| {
            let secs = wait.as_secs();
            if wait.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
        })
    }
}

/// Point-in-time counters for observability endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LimiterStats {
    /// Requests evaluated, whitelisted included.
    pub total_requests: u64,
    /// Requests admitted.
    pub allowed: u64,
    /// Requests refused for any reason.
    pub denied: u64,
    /// Refusals caused by an active block.
    pub blocked: u64,
    /// Requests that bypassed limiting via the whitelist.
    pub whitelisted: u64,
    /// Token buckets currently tracked.
    pub active_buckets: usize,
    /// Clients with an entry on the block list.
    pub blocked_clients: usize,
}

/// Per-client token-bucket limiter with abuse detection and an escalating
/// block list.
///
/// Cheap to share: wrap in an `Arc` and clone the handle into the middleware
/// and any admin surface.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Arc<BucketTable>,
    detector: Arc<AbuseDetector>,
    blocks: Arc<BlockList>,
    whitelist: ArcSwap<Whitelist>,
    block_max: Duration,
    cleanup_started: std::sync::atomic::AtomicBool,
    clock: Arc<dyn Clock>,
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    blocked: AtomicU64,
    whitelisted: AtomicU64,
}

impl RateLimiter {
    /// Build a limiter from validated configuration with the wall clock.
    pub fn new(rate: RateLimitConfig, detector: DetectorConfig) -> Result<Self, ConfigError> {
        Self::with_clock(rate, detector, Arc::new(MonotonicClock::new()))
    }

    /// Build a limiter with an injected clock.
    pub fn with_clock(
        rate: RateLimitConfig,
        detector: DetectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        rate.validate()?;
        let buckets = Arc::new(BucketTable::new(&rate, Arc::clone(&clock))?);
        let detector = Arc::new(AbuseDetector::new(
            detector,
            rate.block_base_duration,
            rate.block_max_duration,
            Arc::clone(&clock),
        )?);
        let blocks = Arc::new(BlockList::new(Arc::clone(&clock)));
        Ok(Self {
            buckets,
            detector,
            blocks,
            whitelist: ArcSwap::from_pointee(Whitelist::new(rate.whitelist.iter())),
            block_max: rate.block_max_duration,
            cleanup_started: std::sync::atomic::AtomicBool::new(false),
            clock,
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            whitelisted: AtomicU64::new(0),
        })
    }

    /// Evaluate one request from `addr` against `path`.
    ///
    /// Order: whitelist, block list, global bucket, per-client bucket. Every
    /// non-whitelisted request feeds the detector; when a signal fires the
    /// block is written immediately. An allowed request that trips a signal
    /// still passes (detection informs the next request, enforcement stays
    /// O(1)); a refused one advertises the block duration as its retry hint.
    pub fn check(&self, addr: &str, path: &str) -> Decision {
        self.total.fetch_add(1, Ordering::Relaxed);

        if self.whitelist.load().contains(addr) {
            self.whitelisted.fetch_add(1, Ordering::Relaxed);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return Decision::Allowed { remaining: f64::INFINITY };
        }

        let client = RateKey::client(addr);
        if let Some(entry) = self.blocks.is_blocked(&client) {
            return self.refuse_blocked(&entry);
        }

        let global = self.buckets.consume_global(1.0);
        if !global.allowed {
            tracing::debug!(client = %client, "global rate limit hit");
            return self.deny(&client, path, global.retry_after);
        }

        let per_client = self.buckets.consume_client(addr, path, 1.0);
        if !per_client.allowed {
            tracing::debug!(client = %client, path, "client rate limit hit");
            return self.deny(&client, path, per_client.retry_after);
        }

        if let Some(decision) = self.observe(&client, path, true) {
            self.blocks.block(client, decision.reason, decision.duration);
        }

        self.allowed.fetch_add(1, Ordering::Relaxed);
        Decision::Allowed { remaining: per_client.remaining }
    }

    fn refuse_blocked(&self, entry: &BlockEntry) -> Decision {
        self.denied.fetch_add(1, Ordering::Relaxed);
        self.blocked.fetch_add(1, Ordering::Relaxed);
        // Permanent manual blocks have no meaningful retry hint; advertise
        // the maximum escalation instead.
        let wait = entry.remaining(self.clock.now_millis()).unwrap_or(self.block_max);
        Decision::Denied { wait, reason: Some(entry.reason) }
    }

    fn deny(&self, client: &RateKey, path: &str, retry_after: Duration) -> Decision {
        self.denied.fetch_add(1, Ordering::Relaxed);
        if let Some(decision) = self.observe(client, path, false) {
            self.blocks.block(client.clone(), decision.reason, decision.duration);
            return Decision::Denied { wait: decision.duration, reason: Some(decision.reason) };
        }
        Decision::Denied { wait: retry_after, reason: None }
    }

    fn observe(
        &self,
        client: &RateKey,
        path: &str,
        allowed: bool,
    ) -> Option<crate::detector::BlockDecision> {
        self.detector.observe(RequestEvent {
            client: client.clone(),
            path: Arc::from(path),
            at_millis: self.clock.now_millis(),
            allowed,
        })
    }

    /// Block a client by hand. Without a duration the block never expires.
    pub fn block_client(&self, addr: &str, duration: Option<Duration>) {
        self.blocks.block_manual(RateKey::client(addr), duration);
    }

    /// Lift a block (false-positive path). Returns whether one existed.
    pub fn unblock_client(&self, addr: &str) -> bool {
        self.blocks.unblock(&RateKey::client(addr))
    }

    /// Forget everything about a client: buckets, detector history, offense
    /// record, and any active block.
    pub fn reset_client(&self, addr: &str) {
        let client = RateKey::client(addr);
        self.buckets.remove_client(addr);
        self.detector.forget(&client);
        self.blocks.unblock(&client);
        tracing::info!(client = %client, "client state reset");
    }

    /// Replace the whitelist atomically; in-flight checks finish against the
    /// snapshot they loaded.
    pub fn update_whitelist<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = Whitelist::new(entries);
        tracing::info!(entries = next.len(), "whitelist replaced");
        self.whitelist.store(Arc::new(next));
    }

    /// Replace the endpoint override table atomically. Existing buckets keep
    /// their old limits until idle eviction recreates them.
    pub fn update_overrides(
        &self,
        overrides: &[(String, EndpointLimit)],
    ) -> Result<(), ConfigError> {
        self.buckets.update_overrides(overrides)
    }

    /// Snapshot the limiter's counters.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            total_requests: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            whitelisted: self.whitelisted.load(Ordering::Relaxed),
            active_buckets: self.buckets.len(),
            blocked_clients: self.blocks.len(),
        }
    }

    /// Spawn the background sweepers (idle bucket eviction, detector history
    /// pruning, block expiry). Idempotent; the tasks exit when the limiter's
    /// components are dropped. Must be called from within a Tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) {
        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.buckets.spawn_idle_eviction(interval);
        self.detector.spawn_sweep(interval);
        self.blocks.spawn_sweep(interval);
    }
}
