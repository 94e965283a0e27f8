//! Bounded, TTL-aware key/value cache with an optional durable backing store.
//!
//! # Layers
//!
//! ```text
//! get ──► memory ──(miss)──► backing store ──(hit)──► promote into memory
//! set ──► memory ──(queued)─► writer task ──► backing store
//! ```
//!
//! The in-memory layer is authoritative for the synchronous API. Writes to
//! the backing store go through a single background writer so that puts,
//! deletes and eviction batches land in the order they were issued.
//! Access-time updates are coalesced and flushed after
//! [`CacheConfig::access_flush_delay`] to bound write amplification from
//! read-heavy workloads.
//!
//! A failing backing store never fails a cache call: the cache degrades to
//! memory-only and logs.

mod sqlite;
mod store;

pub use sqlite::SqliteCacheStore;
pub use store::{CacheRecord, CacheStore};

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

/// Eviction policy applied when a cache exceeds its entry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Reads refresh recency; the least-recently-read entry is evicted.
    Lru,
    /// Reads never affect order; the earliest-inserted entry is evicted.
    Fifo,
}

/// Configuration for a [`BoundedCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace for backing-store keys, also used as a metrics label.
    pub name: String,
    /// Maximum number of in-memory entries.
    pub max_entries: usize,
    /// Eviction policy.
    pub policy: EvictionPolicy,
    /// TTL used by [`BoundedCache::insert`].
    pub default_ttl: Duration,
    /// Debounce window for persisting access-time updates.
    pub access_flush_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            max_entries: 1000,
            policy: EvictionPolicy::Lru,
            default_ttl: Duration::from_secs(3600),
            access_flush_delay: Duration::from_secs(20),
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Bounded TTL cache with LRU or FIFO eviction.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct BoundedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    config: CacheConfig,
    memory: Mutex<MemoryLayer<K, V>>,
    persist: Option<Persistence>,
}

struct Persistence {
    store: Arc<dyn CacheStore>,
    ops: mpsc::UnboundedSender<StoreOp>,
    access: Mutex<AccessUpdates>,
}

#[derive(Default)]
struct AccessUpdates {
    pending: HashMap<String, i64>,
    scheduled: bool,
}

enum StoreOp {
    Put(CacheRecord),
    Delete(String),
    DeleteMany(Vec<String>),
    Touch(Vec<(String, i64)>),
    Flush(oneshot::Sender<()>),
}

/// Entry timestamps in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub expires_at: i64,
    pub stored_at: i64,
    pub access_at: i64,
}

struct Slot<V> {
    value: V,
    expires_at: i64,
    stored_at: i64,
    access_at: i64,
    seq: u64,
}

/// In-memory entries plus an order index.
///
/// `order` maps a monotonically increasing sequence number to its key; the
/// first entry is the next eviction victim under either policy. Under LRU a
/// read moves the entry to a fresh sequence number.
struct MemoryLayer<K, V> {
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> MemoryLayer<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert or replace, returning keys evicted to respect `max_entries`.
    fn insert(&mut self, key: K, slot: Slot<V>, max_entries: usize) -> Vec<K> {
        let seq = self.bump_seq();
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, key.clone());
        self.entries.insert(key, Slot { seq, ..slot });

        let mut evicted = Vec::new();
        while self.entries.len() > max_entries {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    fn refresh(&mut self, key: &K) {
        let seq = self.bump_seq();
        if let Some(slot) = self.entries.get_mut(key) {
            self.order.remove(&slot.seq);
            slot.seq = seq;
            self.order.insert(seq, key.clone());
        }
    }
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Miss,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a memory-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                memory: Mutex::new(MemoryLayer::new()),
                persist: None,
            }),
        }
    }

    /// Create a cache backed by a durable store.
    ///
    /// Spawns the background writer, so this must be called from within a
    /// Tokio runtime.
    pub fn with_store(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(config.name.clone(), Arc::clone(&store), rx));

        tracing::debug!(
            cache = %config.name,
            max_entries = config.max_entries,
            policy = ?config.policy,
            "cache opened with backing store"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                memory: Mutex::new(MemoryLayer::new()),
                persist: Some(Persistence {
                    store,
                    ops,
                    access: Mutex::new(AccessUpdates::default()),
                }),
            }),
        }
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Number of entries held in memory (expired entries included until read).
    pub fn len(&self) -> usize {
        self.inner.memory.lock().entries.len()
    }

    /// Whether the in-memory layer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a key, consulting the backing store on a memory miss.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = now_millis();
        match self.lookup_memory(key, now) {
            Lookup::Hit(value) => Some(value),
            Lookup::Expired => None,
            Lookup::Miss => self.load_from_store(key, now).await,
        }
    }

    /// Look up a key in the in-memory layer only.
    ///
    /// Same expiry and recency semantics as [`get`](Self::get), without
    /// touching the backing store on a miss.
    pub fn get_memory(&self, key: &K) -> Option<V> {
        match self.lookup_memory(key, now_millis()) {
            Lookup::Hit(value) => Some(value),
            Lookup::Expired | Lookup::Miss => None,
        }
    }

    /// Timestamps of an in-memory entry, without affecting recency.
    pub fn entry_info(&self, key: &K) -> Option<EntryInfo> {
        let memory = self.inner.memory.lock();
        memory.entries.get(key).map(|slot| EntryInfo {
            expires_at: slot.expires_at,
            stored_at: slot.stored_at,
            access_at: slot.access_at,
        })
    }

    /// Insert with the configured default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.inner.config.default_ttl);
    }

    /// Insert or replace a value with the given TTL.
    ///
    /// The in-memory write is immediate; persistence is queued.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = now_millis();
        let expires_at = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);

        let record = match &self.inner.persist {
            Some(_) => match serde_json::to_string(&value) {
                Ok(json) => Some(CacheRecord {
                    key: self.store_key(&key),
                    value: json,
                    expires_at,
                    stored_at: now,
                    access_at: now,
                }),
                Err(e) => {
                    tracing::warn!(
                        cache = %self.inner.config.name,
                        key = %key,
                        error = %e,
                        "failed to serialize for cache store"
                    );
                    None
                }
            },
            None => None,
        };

        let evicted = {
            let mut memory = self.inner.memory.lock();
            memory.insert(
                key,
                Slot {
                    value,
                    expires_at,
                    stored_at: now,
                    access_at: now,
                    seq: 0,
                },
                self.inner.config.max_entries,
            )
        };

        if let Some(record) = record {
            self.send(StoreOp::Put(record));
        }
        self.queue_evictions(evicted);
    }

    /// Remove a key from both layers.
    pub fn delete(&self, key: &K) {
        self.inner.memory.lock().remove(key);
        if let Some(persist) = &self.inner.persist {
            let store_key = self.store_key(key);
            persist.access.lock().pending.remove(&store_key);
            self.send(StoreOp::Delete(store_key));
        }
    }

    /// Remove every expired entry from both layers.
    ///
    /// Returns the number of distinct expired entries removed. Write-through
    /// keeps an entry in both layers, so a key counts once whichever layer
    /// held it.
    pub async fn purge_expired(&self) -> usize {
        let now = now_millis();
        let purged_memory = {
            let mut memory = self.inner.memory.lock();
            let expired: Vec<K> = memory
                .entries
                .iter()
                .filter(|(_, slot)| slot.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                memory.remove(key);
            }
            expired.len()
        };

        let Some(persist) = &self.inner.persist else {
            return purged_memory;
        };

        // Let queued writes land before sweeping
        self.flush().await;

        let store = Arc::clone(&persist.store);
        let sweep = tokio::task::spawn_blocking(move || store.delete_expired(now));
        let purged_store = match sweep.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.record_store_error("delete_expired", &e);
                0
            }
            Err(e) => {
                tracing::warn!(
                    cache = %self.inner.config.name,
                    error = %e,
                    "expiry sweep task failed"
                );
                0
            }
        };

        tracing::debug!(
            cache = %self.inner.config.name,
            memory = purged_memory,
            store = purged_store,
            "purged expired entries"
        );
        // Every expired memory slot was flushed to the store before the sweep
        purged_memory.max(purged_store)
    }

    /// Flush pending access-time updates and wait for queued store writes.
    pub async fn flush(&self) {
        let Some(persist) = &self.inner.persist else {
            return;
        };
        let updates = take_access_updates(persist);
        if !updates.is_empty() {
            self.send(StoreOp::Touch(updates));
        }
        let (tx, rx) = oneshot::channel();
        if persist.ops.send(StoreOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn lookup_memory(&self, key: &K, now: i64) -> Lookup<V> {
        let name = &self.inner.config.name;
        let mut memory = self.inner.memory.lock();

        let expired = match memory.entries.get_mut(key) {
            None => return Lookup::Miss,
            Some(slot) if slot.expires_at <= now => true,
            Some(slot) => {
                slot.access_at = now;
                false
            }
        };

        if expired {
            memory.remove(key);
            drop(memory);
            metrics::counter!("cache_misses_total", "cache" => name.clone()).increment(1);
            if self.inner.persist.is_some() {
                self.send(StoreOp::Delete(self.store_key(key)));
            }
            return Lookup::Expired;
        }

        if self.inner.config.policy == EvictionPolicy::Lru {
            memory.refresh(key);
        }
        let value = memory.entries.get(key).map(|slot| slot.value.clone());
        drop(memory);

        match value {
            Some(value) => {
                metrics::counter!("cache_hits_total", "cache" => name.clone(), "layer" => "memory")
                    .increment(1);
                self.queue_access(key, now);
                Lookup::Hit(value)
            }
            None => Lookup::Miss,
        }
    }

    async fn load_from_store(&self, key: &K, now: i64) -> Option<V> {
        let name = &self.inner.config.name;
        let Some(persist) = &self.inner.persist else {
            metrics::counter!("cache_misses_total", "cache" => name.clone()).increment(1);
            return None;
        };

        let store = Arc::clone(&persist.store);
        let store_key = self.store_key(key);
        let lookup_key = store_key.clone();
        let record = match tokio::task::spawn_blocking(move || store.get(&lookup_key)).await {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                metrics::counter!("cache_misses_total", "cache" => name.clone()).increment(1);
                return None;
            }
            Ok(Err(e)) => {
                self.record_store_error("get", &e);
                return None;
            }
            Err(e) => {
                tracing::warn!(cache = %name, error = %e, "store read task failed");
                return None;
            }
        };

        if record.expires_at <= now {
            self.send(StoreOp::Delete(store_key));
            metrics::counter!("cache_misses_total", "cache" => name.clone()).increment(1);
            return None;
        }

        let value: V = match serde_json::from_str(&record.value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    cache = %name,
                    key = %key,
                    error = %e,
                    "corrupt cache record, dropping"
                );
                self.send(StoreOp::Delete(store_key));
                return None;
            }
        };

        // A concurrent set wins over the promoted copy
        let (value, evicted) = {
            let mut memory = self.inner.memory.lock();
            match memory.entries.get(key) {
                Some(existing) => (existing.value.clone(), Vec::new()),
                None => {
                    let evicted = memory.insert(
                        key.clone(),
                        Slot {
                            value: value.clone(),
                            expires_at: record.expires_at,
                            stored_at: record.stored_at,
                            access_at: now,
                            seq: 0,
                        },
                        self.inner.config.max_entries,
                    );
                    (value, evicted)
                }
            }
        };

        metrics::counter!("cache_hits_total", "cache" => name.clone(), "layer" => "store")
            .increment(1);
        self.queue_evictions(evicted);
        self.queue_access(key, now);
        Some(value)
    }

    fn store_key(&self, key: &K) -> String {
        format!("{}:{}", self.inner.config.name, key)
    }

    fn send(&self, op: StoreOp) {
        if let Some(persist) = &self.inner.persist
            && persist.ops.send(op).is_err()
        {
            tracing::debug!(
                cache = %self.inner.config.name,
                "cache writer gone, dropping store op"
            );
        }
    }

    fn queue_evictions(&self, evicted: Vec<K>) {
        if evicted.is_empty() {
            return;
        }
        metrics::counter!("cache_evictions_total", "cache" => self.inner.config.name.clone())
            .increment(evicted.len() as u64);

        let Some(persist) = &self.inner.persist else {
            return;
        };
        let keys: Vec<String> = evicted.iter().map(|k| self.store_key(k)).collect();
        {
            let mut access = persist.access.lock();
            for key in &keys {
                access.pending.remove(key);
            }
        }
        self.send(StoreOp::DeleteMany(keys));
    }

    fn queue_access(&self, key: &K, at: i64) {
        let Some(persist) = &self.inner.persist else {
            return;
        };
        let schedule = {
            let mut access = persist.access.lock();
            access.pending.insert(self.store_key(key), at);
            !std::mem::replace(&mut access.scheduled, true)
        };
        if schedule {
            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.config.access_flush_delay;
            tokio::spawn(flush_access_after(weak, delay));
        }
    }

    fn record_store_error(&self, op: &'static str, error: &crate::Error) {
        metrics::counter!("cache_store_errors_total", "cache" => self.inner.config.name.clone())
            .increment(1);
        tracing::warn!(
            cache = %self.inner.config.name,
            op,
            error = %error,
            "cache store unavailable, serving from memory"
        );
    }
}

fn take_access_updates(persist: &Persistence) -> Vec<(String, i64)> {
    let mut access = persist.access.lock();
    access.scheduled = false;
    access.pending.drain().collect()
}

async fn flush_access_after<K, V>(inner: Weak<Inner<K, V>>, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(persist) = &inner.persist {
        let updates = take_access_updates(persist);
        if !updates.is_empty() && persist.ops.send(StoreOp::Touch(updates)).is_err() {
            tracing::debug!(
                cache = %inner.config.name,
                "cache writer gone, dropping access updates"
            );
        }
    }
}

/// Drain store operations in order, batching whatever is queued.
async fn run_writer(
    name: String,
    store: Arc<dyn CacheStore>,
    mut rx: mpsc::UnboundedReceiver<StoreOp>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(op) = rx.try_recv() {
            batch.push(op);
        }

        let store = Arc::clone(&store);
        let batch_name = name.clone();
        match tokio::task::spawn_blocking(move || apply_batch(&batch_name, store.as_ref(), batch))
            .await
        {
            Ok(acks) => {
                for ack in acks {
                    let _ = ack.send(());
                }
            }
            Err(e) => tracing::warn!(cache = %name, error = %e, "cache writer batch failed"),
        }
    }
    tracing::debug!(cache = %name, "cache writer stopped");
}

fn apply_batch(
    name: &str,
    store: &dyn CacheStore,
    batch: Vec<StoreOp>,
) -> Vec<oneshot::Sender<()>> {
    let mut acks = Vec::new();
    let mut failures = 0u64;

    for op in batch {
        let result = match op {
            StoreOp::Put(record) => store.put(&record),
            StoreOp::Delete(key) => store.delete(&key),
            StoreOp::DeleteMany(keys) => store.delete_many(&keys).map(|_| ()),
            StoreOp::Touch(updates) => store.touch(&updates),
            StoreOp::Flush(ack) => {
                acks.push(ack);
                Ok(())
            }
        };
        if let Err(e) = result {
            failures += 1;
            tracing::debug!(cache = %name, error = %e, "cache store write failed");
        }
    }

    if failures > 0 {
        metrics::counter!("cache_store_errors_total", "cache" => name.to_string())
            .increment(failures);
        tracing::warn!(
            cache = %name,
            failures,
            "cache store writes failed, continuing memory-only"
        );
    }
    acks
}
