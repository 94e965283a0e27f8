//! Durable backing store interface for [`BoundedCache`](super::BoundedCache).

use crate::Result;

/// A persisted cache entry.
///
/// Values are stored as opaque JSON; timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Namespaced key (`<cache name>:<key>`).
    pub key: String,
    /// JSON-serialized value.
    pub value: String,
    /// Absolute expiry time.
    pub expires_at: i64,
    /// When the entry was written.
    pub stored_at: i64,
    /// When the entry was last read.
    pub access_at: i64,
}

/// A durable key/value store backing one or more caches.
///
/// Calls are blocking; the cache drives them from `spawn_blocking` and never
/// from the synchronous read/write path.
pub trait CacheStore: Send + Sync + 'static {
    /// Fetch a record by key.
    fn get(&self, key: &str) -> Result<Option<CacheRecord>>;

    /// Insert or replace a record.
    fn put(&self, record: &CacheRecord) -> Result<()>;

    /// Delete a record. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Delete a batch of records, returning how many existed.
    fn delete_many(&self, keys: &[String]) -> Result<usize>;

    /// Apply coalesced access-time updates.
    fn touch(&self, updates: &[(String, i64)]) -> Result<()>;

    /// Delete every record with `expires_at <= before`, returning the count.
    fn delete_expired(&self, before: i64) -> Result<usize>;
}
