//! Configuration surface for the limiter and the cache tiers.
//!
//! Every config struct has public fields plus a `validate` method; service
//! constructors call `validate` and refuse to start on bad values. Invalid
//! rates or capacities are never clamped silently.

use std::time::Duration;

/// Errors produced when validating configuration at startup.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Rates must be finite and > 0.
    #[error("{field} must be a finite value > 0 (got {provided})")]
    InvalidRate {
        /// Config field name.
        field: &'static str,
        /// Value provided by caller.
        provided: f64,
    },
    /// Capacities must be finite and >= 1.
    #[error("{field} must be a finite value >= 1 (got {provided})")]
    InvalidCapacity {
        /// Config field name.
        field: &'static str,
        /// Value provided by caller.
        provided: f64,
    },
    /// Durations must be non-zero.
    #[error("{field} must be > 0")]
    InvalidDuration {
        /// Config field name.
        field: &'static str,
    },
    /// Thresholds must be > 0.
    #[error("{field} must be > 0")]
    InvalidThreshold {
        /// Config field name.
        field: &'static str,
    },
    /// Endpoint override prefixes must be non-empty and start with '/'.
    #[error("endpoint override prefix {provided:?} must be non-empty and start with '/'")]
    InvalidPrefix {
        /// Prefix provided by caller.
        provided: String,
    },
    /// The escalation cap must not be below the base duration.
    #[error("block_max_duration must be >= block_base_duration")]
    BlockDurationOrder,
    /// Detector windows and thresholds must fit inside the retained history,
    /// or the signal can never fire.
    #[error("{field} exceeds {limit}; the signal could never fire")]
    HistoryBound {
        /// Config field name.
        field: &'static str,
        /// History field it must fit within.
        limit: &'static str,
    },
}

fn check_rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidRate { field, provided: value });
    }
    Ok(())
}

fn check_capacity(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 1.0 {
        return Err(ConfigError::InvalidCapacity { field, provided: value });
    }
    Ok(())
}

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value == Duration::ZERO {
        return Err(ConfigError::InvalidDuration { field });
    }
    Ok(())
}

/// Rate and burst allowance for one endpoint prefix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointLimit {
    /// Sustained allowance, tokens per second.
    pub rate_per_second: f64,
    /// Burst allowance, maximum bucket capacity.
    pub burst_capacity: f64,
}

/// Configuration for the token bucket engine, block list, and whitelist.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Aggregate ceiling across all clients, tokens per second.
    pub global_rate_per_second: f64,
    /// Burst allowance for the global bucket.
    pub global_burst_capacity: f64,
    /// Default sustained allowance per client, tokens per second.
    pub per_client_rate_per_second: f64,
    /// Default burst allowance per client.
    pub burst_capacity: f64,
    /// Path-prefix overrides; resolved by longest-prefix match at startup.
    pub endpoint_overrides: Vec<(String, EndpointLimit)>,
    /// Addresses and address prefixes exempt from all limiting.
    pub whitelist: Vec<String>,
    /// First-offense block duration; doubled per repeat offense.
    pub block_base_duration: Duration,
    /// Escalation cap for automatic blocks.
    pub block_max_duration: Duration,
    /// Buckets idle longer than this are evicted to bound memory.
    pub idle_eviction_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rate_per_second: 100.0,
            global_burst_capacity: 200.0,
            per_client_rate_per_second: 30.0,
            burst_capacity: 60.0,
            endpoint_overrides: Vec::new(),
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            block_base_duration: Duration::from_secs(60),
            block_max_duration: Duration::from_secs(3600),
            idle_eviction_window: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    /// Check all values; called by service constructors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_rate("global_rate_per_second", self.global_rate_per_second)?;
        check_capacity("global_burst_capacity", self.global_burst_capacity)?;
        check_rate("per_client_rate_per_second", self.per_client_rate_per_second)?;
        check_capacity("burst_capacity", self.burst_capacity)?;
        for (prefix, limit) in &self.endpoint_overrides {
            if prefix.is_empty() || !prefix.starts_with('/') {
                return Err(ConfigError::InvalidPrefix { provided: prefix.clone() });
            }
            check_rate("endpoint_overrides.rate_per_second", limit.rate_per_second)?;
            check_capacity("endpoint_overrides.burst_capacity", limit.burst_capacity)?;
        }
        check_duration("block_base_duration", self.block_base_duration)?;
        check_duration("block_max_duration", self.block_max_duration)?;
        if self.block_max_duration < self.block_base_duration {
            return Err(ConfigError::BlockDurationOrder);
        }
        check_duration("idle_eviction_window", self.idle_eviction_window)?;
        Ok(())
    }
}

/// Thresholds for the abuse detector.
///
/// The distributed-attack window and threshold are deliberately configuration
/// rather than constants; correlation tuning is deployment-specific.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Requests within `burst_window` from one client that count as a burst.
    pub burst_threshold: u32,
    /// Window for the burst signal.
    pub burst_window: Duration,
    /// Distinct low-repetition paths within `scan_window` that count as a
    /// scan.
    pub scan_path_threshold: u32,
    /// Window for the scan signal.
    pub scan_window: Duration,
    /// Paths repeated more than this within the scan window stop counting as
    /// scan evidence (scans have low per-path repetition).
    pub scan_max_repetition: u32,
    /// Absolute per-client request ceiling within `volume_window`.
    pub volume_ceiling: u32,
    /// Window for the volume signal.
    pub volume_window: Duration,
    /// Distinct clients with suspicious hits within `distributed_window`
    /// that count as a distributed pattern.
    pub distributed_threshold: u32,
    /// Process-wide window for the distributed signal.
    pub distributed_window: Duration,
    /// Offenses within this window of each other escalate block duration.
    pub offense_lookback: Duration,
    /// How much per-client history the sliding window retains.
    pub history_window: Duration,
    /// Hard cap on events retained per client.
    pub history_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 50,
            burst_window: Duration::from_secs(1),
            scan_path_threshold: 20,
            scan_window: Duration::from_secs(10),
            scan_max_repetition: 2,
            volume_ceiling: 1000,
            volume_window: Duration::from_secs(60),
            distributed_threshold: 30,
            distributed_window: Duration::from_secs(10),
            offense_lookback: Duration::from_secs(600),
            history_window: Duration::from_secs(120),
            history_capacity: 1024,
        }
    }
}

impl DetectorConfig {
    /// Check all values; called by [`crate::detector::AbuseDetector::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "burst_threshold" });
        }
        if self.scan_path_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "scan_path_threshold" });
        }
        if self.volume_ceiling == 0 {
            return Err(ConfigError::InvalidThreshold { field: "volume_ceiling" });
        }
        if self.distributed_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "distributed_threshold" });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidThreshold { field: "history_capacity" });
        }
        check_duration("burst_window", self.burst_window)?;
        check_duration("scan_window", self.scan_window)?;
        check_duration("volume_window", self.volume_window)?;
        check_duration("distributed_window", self.distributed_window)?;
        check_duration("offense_lookback", self.offense_lookback)?;
        check_duration("history_window", self.history_window)?;
        // Signals count events the history still holds; a window or
        // threshold beyond the retained history would silently never fire.
        for (field, window) in [
            ("burst_window", self.burst_window),
            ("scan_window", self.scan_window),
            ("volume_window", self.volume_window),
        ] {
            if window > self.history_window {
                return Err(ConfigError::HistoryBound { field, limit: "history_window" });
            }
        }
        for (field, threshold) in [
            ("burst_threshold", self.burst_threshold),
            ("scan_path_threshold", self.scan_path_threshold),
            ("volume_ceiling", self.volume_ceiling),
        ] {
            if threshold as usize >= self.history_capacity {
                return Err(ConfigError::HistoryBound { field, limit: "history_capacity" });
            }
        }
        Ok(())
    }
}

/// Configuration for the tiered cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Primary store address, e.g. `redis://127.0.0.1:6379`. `None` runs
    /// fallback-only.
    pub primary_store_url: Option<String>,
    /// Prefix applied to every store key.
    pub key_prefix: String,
    /// TTL used when callers pass none.
    pub default_ttl: Duration,
    /// Hard TTL cap; longer requests are reduced to this.
    pub max_ttl: Duration,
    /// Maximum entries in the in-process fallback store.
    pub fallback_capacity: usize,
    /// Values serialized above this size are gzip-compressed.
    pub compression_threshold_bytes: usize,
    /// Interval for the background sweep of expired fallback entries.
    pub cleanup_interval: Duration,
    /// Per-operation timeout against the primary store; the failure path is
    /// bounded by this.
    pub op_timeout: Duration,
    /// Interval for the primary health ping; doubles as the reconnect timer.
    pub ping_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            primary_store_url: None,
            key_prefix: "tollgate:".to_string(),
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(86_400),
            fallback_capacity: 10_000,
            compression_threshold_bytes: 1024,
            cleanup_interval: Duration::from_secs(300),
            op_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl CacheConfig {
    /// Check all values; called by [`crate::cache::TieredCache::connect`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("default_ttl", self.default_ttl)?;
        check_duration("max_ttl", self.max_ttl)?;
        check_duration("cleanup_interval", self.cleanup_interval)?;
        check_duration("op_timeout", self.op_timeout)?;
        check_duration("ping_interval", self.ping_interval)?;
        if self.fallback_capacity == 0 {
            return Err(ConfigError::InvalidThreshold { field: "fallback_capacity" });
        }
        Ok(())
    }
}
