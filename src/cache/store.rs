//! Byte-level store interface the cache tiers implement.

use async_trait::async_trait;
use std::time::Duration;

/// Errors surfaced by cache operations.
///
/// `Unavailable` means the backend could not be reached and the caller may
/// fall back to another tier; the other variants are real faults.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backend could not be reached (connection refused, dropped, or the
    /// operation timed out).
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A value could not be serialized or deserialized.
    #[error("cache serialization failed for key {key}: {message}")]
    Serialization {
        /// Key whose value failed to round-trip.
        key: String,
        /// Underlying codec error.
        message: String,
    },

    /// The backend answered with an error (wrong type, protocol fault).
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Whether the error means the backend is down rather than the request
    /// being bad.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Abstract key-value store over raw bytes with TTLs.
///
/// Implementations own expiry: a read of an expired entry behaves as a miss.
/// Counters written by `increment` are stored as ASCII decimal so every tier
/// agrees on the representation.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value. `Ok(None)` is a miss, expired entries included.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Fetch several keys in one round trip, preserving order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    /// Store several entries in one round trip, all with the same TTL.
    async fn multi_set(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration)
        -> Result<(), CacheError>;

    /// Add `delta` to the ASCII-decimal counter at `key`, creating it at zero
    /// if absent, and refresh its TTL. Returns the new value.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Delete every key matching a glob pattern (`*` wildcard). Returns the
    /// number removed.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Last known health, without a round trip.
    fn is_healthy(&self) -> bool;

    /// Short tier name for logs.
    fn name(&self) -> &'static str;
}

/// Glob match supporting `*` as a multi-character wildcard, the subset of
/// Redis `MATCH` syntax the gateway uses for invalidation patterns.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
