//! Stateful abuse detection over a sliding window of request events.
//!
//! The detector only classifies; it never decides allow/deny for the current
//! request. Enforcement stays in the middleware, which is synchronous and
//! O(1), while detection is allowed to look back over a longer horizon.

use crate::clock::Clock;
use crate::config::{ConfigError, DetectorConfig};
use crate::key::RateKey;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Why a key was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    /// Request rate inside the burst window exceeded the burst threshold.
    Burst,
    /// High path diversity with low per-path repetition: endpoint scanning.
    Scan,
    /// Correlated suspicious hits from many distinct clients.
    Distributed,
    /// Aggregate request count crossed the absolute ceiling.
    Volume,
    /// Operator-issued block.
    Manual,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockReason::Burst => "burst",
            BlockReason::Scan => "scan",
            BlockReason::Distributed => "distributed",
            BlockReason::Volume => "volume",
            BlockReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A block recommendation produced by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDecision {
    /// Classified signal.
    pub reason: BlockReason,
    /// Escalated block duration.
    pub duration: Duration,
}

/// One observed request, fed to the detector on every allow and deny.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Client-scoped key for the subject.
    pub client: RateKey,
    /// Endpoint path requested.
    pub path: Arc<str>,
    /// When the request was observed.
    pub at_millis: u64,
    /// Whether the limiter allowed it.
    pub allowed: bool,
}

#[derive(Debug, Clone)]
struct EventSample {
    at_millis: u64,
    path: Arc<str>,
    allowed: bool,
}

#[derive(Debug, Default)]
struct History {
    events: VecDeque<EventSample>,
}

#[derive(Debug, Clone, Copy)]
struct Offense {
    consecutive: u32,
    last_at_millis: u64,
}

/// Process-wide ring of suspicious hits used for the distributed signal.
/// Kept behind one mutex; the critical section is push + prune + count.
#[derive(Debug, Default)]
struct SuspiciousRing {
    hits: VecDeque<(u64, RateKey)>,
    per_client: HashMap<RateKey, u32>,
}

impl SuspiciousRing {
    fn record_and_count(&mut self, now: u64, window_millis: u64, client: &RateKey) -> usize {
        self.hits.push_back((now, client.clone()));
        *self.per_client.entry(client.clone()).or_insert(0) += 1;
        while let Some((at, _)) = self.hits.front() {
            if now.saturating_sub(*at) <= window_millis {
                break;
            }
            let Some((_, old)) = self.hits.pop_front() else { break };
            if let Some(count) = self.per_client.get_mut(&old) {
                *count -= 1;
                if *count == 0 {
                    self.per_client.remove(&old);
                }
            }
        }
        self.per_client.len()
    }
}

/// Sliding-window classifier for burst, scan, distributed, and volume abuse.
///
/// Per-key history lives in a sharded map; classification runs inside the
/// key's entry so the window update and the verdict are consistent. Block
/// durations escalate per consecutive offense inside the lookback window,
/// doubling from the base and capped at the maximum.
#[derive(Debug)]
pub struct AbuseDetector {
    config: DetectorConfig,
    block_base: Duration,
    block_max: Duration,
    histories: DashMap<RateKey, History>,
    offenses: DashMap<RateKey, Offense>,
    suspicious: Mutex<SuspiciousRing>,
    clock: Arc<dyn Clock>,
}

impl AbuseDetector {
    /// Build a detector from validated configuration.
    pub fn new(
        config: DetectorConfig,
        block_base: Duration,
        block_max: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if block_base == Duration::ZERO {
            return Err(ConfigError::InvalidDuration { field: "block_base_duration" });
        }
        if block_max < block_base {
            return Err(ConfigError::BlockDurationOrder);
        }
        Ok(Self {
            config,
            block_base,
            block_max,
            histories: DashMap::new(),
            offenses: DashMap::new(),
            suspicious: Mutex::new(SuspiciousRing::default()),
            clock,
        })
    }

    /// Feed one request event; returns a block recommendation when a signal
    /// fires. The caller is responsible for writing it to the block list.
    pub fn observe(&self, event: RequestEvent) -> Option<BlockDecision> {
        let now = event.at_millis;
        let reason = {
            let mut entry = self.histories.entry(event.client.clone()).or_default();
            let history = entry.value_mut();
            history.events.push_back(EventSample {
                at_millis: now,
                path: event.path.clone(),
                allowed: event.allowed,
            });
            self.prune(history, now);
            self.classify(history, now)
        };

        // The distributed signal runs even when the per-key signals stay
        // quiet: denials from many distinct clients inside a short global
        // window betray coordination no single key shows.
        let reason = reason.or_else(|| self.distributed_signal(&event, now));

        let reason = reason?;
        // Start the window fresh after an offense so the same events cannot
        // re-trigger immediately once the block lapses.
        self.histories.remove(&event.client);
        let duration = self.escalate(&event.client, now);
        tracing::warn!(
            client = %event.client,
            %reason,
            block_secs = duration.as_secs(),
            "abuse pattern detected"
        );
        Some(BlockDecision { reason, duration })
    }

    fn prune(&self, history: &mut History, now: u64) {
        let window = self.config.history_window.as_millis() as u64;
        while let Some(front) = history.events.front() {
            if now.saturating_sub(front.at_millis) <= window
                && history.events.len() <= self.config.history_capacity
            {
                break;
            }
            history.events.pop_front();
        }
    }

    fn classify(&self, history: &History, now: u64) -> Option<BlockReason> {
        if self.count_within(history, now, self.config.volume_window)
            > self.config.volume_ceiling as usize
        {
            return Some(BlockReason::Volume);
        }
        if self.count_within(history, now, self.config.burst_window)
            > self.config.burst_threshold as usize
        {
            return Some(BlockReason::Burst);
        }
        if self.scan_signal(history, now) {
            return Some(BlockReason::Scan);
        }
        None
    }

    fn count_within(&self, history: &History, now: u64, window: Duration) -> usize {
        let window = window.as_millis() as u64;
        history
            .events
            .iter()
            .rev()
            .take_while(|e| now.saturating_sub(e.at_millis) <= window)
            .count()
    }

    /// Scan: path diversity above the threshold with low per-path
    /// repetition. Heavily repeated paths are normal traffic and do not
    /// count as scan evidence.
    fn scan_signal(&self, history: &History, now: u64) -> bool {
        let window = self.config.scan_window.as_millis() as u64;
        let mut per_path: HashMap<&str, u32> = HashMap::new();
        for event in history
            .events
            .iter()
            .rev()
            .take_while(|e| now.saturating_sub(e.at_millis) <= window)
        {
            *per_path.entry(&event.path).or_insert(0) += 1;
        }
        let low_repetition = per_path
            .values()
            .filter(|&&count| count <= self.config.scan_max_repetition)
            .count();
        low_repetition > self.config.scan_path_threshold as usize
    }

    fn distributed_signal(&self, event: &RequestEvent, now: u64) -> Option<BlockReason> {
        if event.allowed {
            return None;
        }
        let window = self.config.distributed_window.as_millis() as u64;
        // A poisoned lock means a panic mid-record; the ring is still
        // structurally sound, so keep counting.
        let distinct = self
            .suspicious
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_and_count(now, window, &event.client);
        (distinct > self.config.distributed_threshold as usize).then_some(BlockReason::Distributed)
    }

    /// Base duration doubled per consecutive offense in the lookback window,
    /// capped at the maximum.
    fn escalate(&self, client: &RateKey, now: u64) -> Duration {
        let lookback = self.config.offense_lookback.as_millis() as u64;
        let mut entry = self
            .offenses
            .entry(client.clone())
            .or_insert(Offense { consecutive: 0, last_at_millis: now });
        let offense = entry.value_mut();
        if offense.consecutive > 0 && now.saturating_sub(offense.last_at_millis) > lookback {
            offense.consecutive = 0;
        }
        offense.consecutive = offense.consecutive.saturating_add(1);
        offense.last_at_millis = now;

        let doublings = offense.consecutive - 1;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.block_base
            .checked_mul(factor)
            .map(|d| d.min(self.block_max))
            .unwrap_or(self.block_max)
    }

    /// Forget everything recorded for a client (operator reset path).
    pub fn forget(&self, client: &RateKey) {
        self.histories.remove(client);
        self.offenses.remove(client);
    }

    /// Drop histories and offense records that have aged out. Runs on a
    /// timer; each removal holds one shard lock briefly.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let history_window = self.config.history_window.as_millis() as u64;
        let lookback = self.config.offense_lookback.as_millis() as u64;
        let before = self.histories.len() + self.offenses.len();
        self.histories.retain(|_, history| {
            history
                .events
                .back()
                .is_some_and(|e| now.saturating_sub(e.at_millis) <= history_window)
        });
        self.offenses
            .retain(|_, offense| now.saturating_sub(offense.last_at_millis) <= lookback);
        before - (self.histories.len() + self.offenses.len())
    }

    /// Spawn the history sweeper; exits when the detector is dropped.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(detector) => {
                        detector.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
