//! Named cache stores for intercepted responses.
//!
//! This module provides the storage half of the offline cache:
//! - Stores are identified by a versioned name (e.g. "app-cache-v2")
//! - Each store maps a request identity (method + URL) to a full response
//! - Stores can be listed and deleted wholesale, which is how old versions are pruned

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheEntryInfo, CacheSource, CachedResponse, FetchResult, StoreSummary};
