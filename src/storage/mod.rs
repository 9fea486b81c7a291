//! Storage layer: the sharded engine the execute stage runs commands against.
//!
//! Only the execute stage ever touches a shard, and it does so through
//! [`StorageEngine`] with the key's home shard locked for the duration of a
//! single map operation. Shard locks are the innermost locks in the server's
//! lock hierarchy.

pub mod engine;

pub use engine::{StorageEngine, StorageStats, NUM_SHARDS};
