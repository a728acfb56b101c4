//! In-memory entry cache: LRU by ID with a secondary DN map, reader
//! counts, per-ID locks in DN-depth order, and transaction-aware
//! install/evict.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod lru;

pub mod cache;

pub use cache::{CacheHandle, CacheStats, EntryCache, PendingInstall};
