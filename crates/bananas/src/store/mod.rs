//! Store abstraction.
//!
//! Every other component talks to the coordination store through the
//! [`Store`] trait: list, sorted-set, hash, and string operations with TTLs,
//! a multi-source blocking move, pub/sub, ordered non-atomic batches, and
//! one atomic read-compare-write used for lock release. Exact wire commands
//! are an implementation detail; any backend providing these semantics is
//! compatible.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::BananasResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// A write operation inside a [`Store::pipeline`] batch.
///
/// Batches are order-preserving but not atomic; composite queue mutations
/// rely on the single job record being authoritative, not on cross-key
/// atomicity.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Set a string key.
    Set { key: String, value: String },
    /// Set a string key with a TTL.
    SetEx {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    /// Delete a key.
    Del { key: String },
    /// Apply a TTL to an existing key.
    Expire { key: String, ttl_secs: u64 },
    /// Push to the head of a list.
    LPush { key: String, value: String },
    /// Push to the tail of a list (the consumption end).
    RPush { key: String, value: String },
    /// Remove occurrences of a value from a list.
    LRem {
        key: String,
        count: i64,
        value: String,
    },
    /// Add a member to a sorted set.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove a member from a sorted set.
    ZRem { key: String, member: String },
    /// Set hash fields.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Publish a message on a channel.
    Publish { channel: String, message: String },
}

/// An active pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Receives the next message, or `None` if the subscription closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Minimal store surface required by the queue engine, result backend,
/// and schedulers.
#[async_trait]
pub trait Store: Send + Sync {
    // Strings.
    async fn get(&self, key: &str) -> BananasResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> BananasResult<()>;
    /// Set only if absent, with a TTL. Returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BananasResult<bool>;
    async fn del(&self, key: &str) -> BananasResult<()>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> BananasResult<()>;
    /// Batch fetch; one round trip for any number of keys.
    async fn mget(&self, keys: &[String]) -> BananasResult<Vec<Option<String>>>;

    // Lists.
    async fn lpush(&self, key: &str, value: &str) -> BananasResult<()>;
    async fn rpush(&self, key: &str, value: &str) -> BananasResult<()>;
    async fn lrem(&self, key: &str, count: i64, value: &str) -> BananasResult<u64>;
    async fn llen(&self, key: &str) -> BananasResult<u64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> BananasResult<Vec<String>>;

    /// Blocking pop-and-move over multiple source lists.
    ///
    /// Scans `sources` in the given order and atomically moves the first
    /// available element to `dest`, blocking up to `timeout` when all
    /// sources are empty. The scan order is what gives dequeue its priority
    /// and routing-key preference. Returns `None` on timeout.
    async fn brpoplpush(
        &self,
        sources: &[String],
        dest: &str,
        timeout: Duration,
    ) -> BananasResult<Option<String>>;

    // Sorted sets.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> BananasResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> BananasResult<()>;
    /// Members with score in `(-inf, max]`, ascending.
    async fn zrangebyscore_upto(&self, key: &str, max: f64) -> BananasResult<Vec<String>>;
    async fn zcard(&self, key: &str) -> BananasResult<u64>;

    // Hashes.
    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> BananasResult<()>;
    async fn hgetall(&self, key: &str) -> BananasResult<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> BananasResult<i64>;

    // Pub/sub.
    async fn publish(&self, channel: &str, message: &str) -> BananasResult<()>;
    async fn subscribe(&self, channel: &str) -> BananasResult<Subscription>;

    /// Atomically delete `key` iff it currently holds `token`.
    ///
    /// This is the scripted read-compare-write that makes distributed lock
    /// release safe: a holder whose TTL expired cannot release a lock that
    /// has since been taken by someone else.
    async fn compare_and_delete(&self, key: &str, token: &str) -> BananasResult<bool>;

    /// Apply a batch of writes in order with O(1) round trips.
    async fn pipeline(&self, ops: Vec<StoreOp>) -> BananasResult<()>;

    /// Health check.
    async fn ping(&self) -> BananasResult<()>;
}
