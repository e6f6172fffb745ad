//! Tiered response cache: a Redis-compatible primary store with a bounded
//! in-process fallback behind one typed façade.

pub mod fallback;
pub mod primary;
pub mod store;
pub mod tiered;

pub use fallback::MemoryStore;
pub use primary::RedisStore;
pub use store::{CacheError, CacheStore};
pub use tiered::{CacheStats, TieredCache};
