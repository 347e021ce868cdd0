//! Backing stores for the shared-state strategies.
//!
//! Each trait mirrors one wire contract: a memcached-style counter cache, a
//! redis-style list, and a redis-style sorted set. Strategies are generic over
//! these so they can run against the real services or the in-process
//! [`MemoryStore`].

mod memcached;
mod memory;
mod redis;

pub use self::memcached::{cache_key, MemcachedStore};
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Memcached-style key/value cache holding integer counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a counter, `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Write a counter that expires after `ttl_secs`.
    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<()>;

    /// Drop every key in the cache.
    async fn flush(&self) -> Result<()>;

    /// Release the connection. Later calls fail with `StoreUnavailable`.
    async fn close(&self) -> Result<()>;
}

/// Redis-style list of strings.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Append to the tail, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Expire the whole key after `ttl_ms`.
    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Redis-style sorted set with integer scores.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Remove members with `min <= score < max_exclusive`.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max_exclusive: i64) -> Result<usize>;

    /// 0-based position of `member` in ascending score order.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Build the store key for a caller.
pub fn caller_key(prefix: &str, caller_id: &str) -> String {
    format!("{}:{}", prefix, caller_id)
}
