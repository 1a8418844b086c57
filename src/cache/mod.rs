//! Versioned cache buckets for offline support.
//!
//! This module provides the storage side of the offline cache:
//! - Named buckets, one per deployed cache version
//! - Request keys with cache-match semantics (GET only, fragment ignored)
//! - Atomic batch stores used when pre-caching assets
//! - SQLite persistence so buckets survive between runs

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey, ResponseSource, Served, StoredResponse};
