//! Session-scoped memory cache with stale-while-revalidate reads.
//!
//! This module provides:
//! - A cache actor that owns every entry and serialises get/set/invalidate
//! - Per-key generation counters so a late response cannot clobber a newer one
//! - Optional coalescing of concurrent fetches for the same key
//! - `Query<T>`, the consumer-facing handle exposing data, loading and error state

mod actor;
mod entry;
mod query;

pub use actor::{CacheHandle, MemoryCache, Ticket};
pub use entry::{CacheEntry, CacheOptions, Lookup};
pub use query::Query;
