#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Gateway-side traffic protection for Rust services: per-client token-bucket
//! rate limiting with abuse detection, and a tiered response cache that fails
//! over to process memory when its primary store is down.
//!
//! ## Features
//!
//! - **Token buckets** per client and per client+endpoint, with a process-wide
//!   global bucket and longest-prefix endpoint overrides
//! - **Abuse detection** for burst, scan, distributed, and volume patterns,
//!   with escalating time-bounded blocks
//! - **Tower middleware** that answers refusals with a `Retry-After` value
//! - **Tiered cache** with gzip compression, a binary serialization fallback,
//!   and transparent failover to a bounded in-process LRU
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{DetectorConfig, RateLimitConfig, RateLimiter};
//!
//! # fn main() -> Result<(), tollgate::ConfigError> {
//! let limiter = RateLimiter::new(RateLimitConfig::default(), DetectorConfig::default())?;
//!
//! let decision = limiter.check("203.0.113.7", "/api/orders");
//! if let Some(wait) = decision.retry_after_secs() {
//!     println!("429, Retry-After: {}", wait);
//! }
//! # Ok(())
//! # }
//! ```

pub mod blocklist;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod key;
pub mod limiter;
pub mod middleware;

// Re-exports
pub use blocklist::{BlockEntry, BlockList};
pub use bucket::{BucketTable, Consumption};
pub use cache::{CacheError, CacheStats, CacheStore, MemoryStore, RedisStore, TieredCache};
pub use clock::{Clock, MonotonicClock};
pub use config::{CacheConfig, ConfigError, DetectorConfig, EndpointLimit, RateLimitConfig};
pub use detector::{AbuseDetector, BlockDecision, BlockReason, RequestEvent};
pub use error::GateError;
pub use key::{RateKey, Whitelist};
pub use limiter::{Decision, LimiterStats, RateLimiter};
pub use middleware::{RateLimitLayer, RateLimitService};
