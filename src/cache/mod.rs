//! Local data tiers for offline support.
//!
//! This module provides:
//! - A short-lived in-memory TTL cache per collection
//! - A durable key-value substrate (SQLite or process memory)
//! - Per-owner fallback snapshots used when the remote is unavailable

mod fallback;
mod memory;
mod storage;
mod traits;

pub use fallback::{FallbackStore, DEFAULT_STALE_AFTER_DAYS};
pub use memory::{CacheEntry, CacheSet, TtlCache, DEFAULT_TTL_SECS};
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage};
pub use traits::{collection_key, DataSource, FetchResult, Record};
