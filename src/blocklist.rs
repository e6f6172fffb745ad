//! Time-bounded deny-list of rate-limit subjects.
//!
//! Consulted by the middleware before any bucket work, so lookup is O(1)
//! amortized. Expired entries are treated as absent on read (lazy expiry)
//! and also dropped by a timed sweep.

use crate::clock::Clock;
use crate::detector::BlockReason;
use crate::key::RateKey;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A recorded block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEntry {
    /// Why the key was blocked.
    pub reason: BlockReason,
    /// When the block was recorded.
    pub blocked_at_millis: u64,
    /// When the block lapses. `None` means a manual block with no expiry.
    pub expires_at_millis: Option<u64>,
}

impl BlockEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_millis.is_some_and(|at| now >= at)
    }

    /// Remaining block time at `now`. `None` for permanent manual blocks.
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        self.expires_at_millis
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }
}

/// Concurrent deny-list keyed by client.
///
/// Re-blocking a key replaces its entry with the refreshed expiry the
/// detector's escalation produced.
#[derive(Debug)]
pub struct BlockList {
    entries: DashMap<RateKey, BlockEntry>,
    clock: Arc<dyn Clock>,
}

impl BlockList {
    /// Create an empty block list.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    /// Whether `key` is currently blocked. Expired entries are removed on
    /// the way out, so a lapsed block is observed as absent exactly once
    /// state transitions.
    pub fn is_blocked(&self, key: &RateKey) -> Option<BlockEntry> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.clone())
    }

    /// Record a detector-issued block for `duration`.
    pub fn block(&self, key: RateKey, reason: BlockReason, duration: Duration) {
        let now = self.clock.now_millis();
        let entry = BlockEntry {
            reason,
            blocked_at_millis: now,
            expires_at_millis: Some(now.saturating_add(duration.as_millis() as u64)),
        };
        tracing::info!(client = %key, %reason, block_secs = duration.as_secs(), "client blocked");
        self.entries.insert(key, entry);
    }

    /// Record an operator-issued block. Without a duration it never expires
    /// and only `unblock` removes it.
    pub fn block_manual(&self, key: RateKey, duration: Option<Duration>) {
        let now = self.clock.now_millis();
        let entry = BlockEntry {
            reason: BlockReason::Manual,
            blocked_at_millis: now,
            expires_at_millis: duration.map(|d| now.saturating_add(d.as_millis() as u64)),
        };
        tracing::info!(client = %key, permanent = duration.is_none(), "manual block recorded");
        self.entries.insert(key, entry);
    }

    /// Remove a block (operator path for false positives). Returns whether
    /// an entry existed.
    pub fn unblock(&self, key: &RateKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            tracing::info!(client = %key, "client unblocked");
        }
        removed
    }

    /// Drop expired entries. Runs on a timer; each removal holds one shard
    /// lock briefly.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - self.entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = self.entries.len(), "swept expired blocks");
        }
        swept
    }

    /// Number of recorded entries, expired-but-unswept included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the expiry sweeper; exits when the block list is dropped.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(list) => {
                        list.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
