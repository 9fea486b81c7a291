//! Sharded in-memory key-value engine.
//!
//! Keys are distributed over a fixed number of independent shards, each with
//! its own reader-writer lock, so commands touching different keys rarely
//! contend:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐       ┌─────────┐     │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │  ...  │ Shard 9 │     │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │       │ RwLock  │     │
//! │  │ HashMap │ │ HashMap │ │ HashMap │       │ HashMap │     │
//! │  └─────────┘ └─────────┘ └─────────┘       └─────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A key lives in exactly the shard `partition(key)` selects, for the whole
//! life of the process. GET takes the shard's read lock; SET and DEL take the
//! write lock. Critical sections contain only the map operation itself.
//!
//! Values are opaque [`RespValue`] trees. The engine stores and returns them
//! verbatim and never looks inside.

use crate::protocol::RespValue;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of independent partitions. Tunable; every key maps to exactly one
/// shard, so changing this invalidates all stored keys.
pub const NUM_SHARDS: usize = 10;

/// One partition of the keyspace.
#[derive(Debug, Default)]
struct Shard {
    map: RwLock<HashMap<Bytes, RespValue>>,
}

/// The shared key-value store behind the execute stage.
///
/// Wrapped in an `Arc` and handed to every worker; all operations take
/// `&self` and lock only the one shard the key hashes to.
pub struct StorageEngine {
    shards: Vec<Shard>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("keys", &self.len())
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
        }
    }

    /// The shard index a key belongs to. Stable for the process lifetime:
    /// `DefaultHasher::new()` always starts from the same state.
    #[inline]
    pub fn partition(key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[Self::partition(key)]
    }

    /// Looks up a key under the shard's read lock.
    pub fn get(&self, key: &Bytes) -> Option<RespValue> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.shard(key).map.read().get(key).cloned()
    }

    /// Stores a value, replacing any previous one.
    ///
    /// Returns `true` if the key already existed.
    pub fn set(&self, key: Bytes, value: RespValue) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        self.shard(&key).map.write().insert(key, value).is_some()
    }

    /// Removes a key. Returns `true` if it was present.
    pub fn del(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        self.shard(key).map.write().remove(key).is_some()
    }

    /// Total keys across all shards. Takes each shard's read lock in turn.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.map.read().is_empty())
    }

    /// Operation counters since startup.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len() as u64,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn shard_len(&self, index: usize) -> usize {
        self.shards[index].map.read().len()
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
}
