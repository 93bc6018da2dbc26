//! In-process store implementation.
//!
//! Provides the full [`Store`] surface over process-local state, for tests
//! and single-process development. Semantics mirror the Redis backend:
//! lists are double-ended, the blocking move wakes on writes instead of
//! polling, and pub/sub is fan-out.

use super::{Store, StoreOp, Subscription};
use crate::error::BananasResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    expirations: HashMap<String, Instant>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl State {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expirations.get(key) {
            if Instant::now() >= *deadline {
                self.expirations.remove(key);
                self.strings.remove(key);
                self.hashes.remove(key);
                self.lists.remove(key);
                self.zsets.remove(key);
            }
        }
    }

    fn publish(&mut self, channel: &str, message: &str) {
        if let Some(sender) = self.channels.get(channel) {
            // No subscribers is not an error, same as Redis.
            let _ = sender.send(message.to_string());
        }
    }

    fn apply(&mut self, op: &StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.expirations.remove(key);
                self.strings.insert(key.clone(), value.clone());
            }
            StoreOp::SetEx {
                key,
                value,
                ttl_secs,
            } => {
                self.strings.insert(key.clone(), value.clone());
                self.expirations
                    .insert(key.clone(), Instant::now() + Duration::from_secs(*ttl_secs));
            }
            StoreOp::Del { key } => {
                self.expirations.remove(key);
                self.strings.remove(key);
                self.hashes.remove(key);
                self.lists.remove(key);
                self.zsets.remove(key);
            }
            StoreOp::Expire { key, ttl_secs } => {
                self.expirations
                    .insert(key.clone(), Instant::now() + Duration::from_secs(*ttl_secs));
            }
            StoreOp::LPush { key, value } => {
                self.lists
                    .entry(key.clone())
                    .or_default()
                    .push_front(value.clone());
            }
            StoreOp::RPush { key, value } => {
                self.lists
                    .entry(key.clone())
                    .or_default()
                    .push_back(value.clone());
            }
            StoreOp::LRem { key, count, value } => {
                self.lrem(key, *count, value);
            }
            StoreOp::ZAdd { key, member, score } => {
                let set = self.zsets.entry(key.clone()).or_default();
                set.retain(|(m, _)| m != member);
                set.push((member.clone(), *score));
            }
            StoreOp::ZRem { key, member } => {
                if let Some(set) = self.zsets.get_mut(key) {
                    set.retain(|(m, _)| m != member);
                }
            }
            StoreOp::HSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            StoreOp::Publish { channel, message } => {
                self.publish(channel, message);
            }
        }
    }

    fn lrem(&mut self, key: &str, count: i64, value: &str) -> u64 {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let mut removed = 0u64;
        let limit = if count == 0 { u64::MAX } else { count.unsigned_abs() };

        if count >= 0 {
            let mut kept = VecDeque::with_capacity(list.len());
            for item in list.drain(..) {
                if removed < limit && item == value {
                    removed += 1;
                } else {
                    kept.push_back(item);
                }
            }
            *list = kept;
        } else {
            let mut kept = VecDeque::with_capacity(list.len());
            for item in list.drain(..).rev() {
                if removed < limit && item == value {
                    removed += 1;
                } else {
                    kept.push_front(item);
                }
            }
            *list = kept;
        }
        removed
    }
}

/// Process-local [`Store`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    writes: Arc<Notify>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_move(&self, sources: &[String], dest: &str) -> Option<String> {
        let mut state = self.state.lock();
        for source in sources {
            let popped = state.lists.get_mut(source).and_then(VecDeque::pop_back);
            if let Some(value) = popped {
                state
                    .lists
                    .entry(dest.to_string())
                    .or_default()
                    .push_front(value.clone());
                return Some(value);
            }
        }
        None
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> BananasResult<Option<String>> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BananasResult<bool> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.apply(&StoreOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        Ok(true)
    }

    async fn del(&self, key: &str) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::Del {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::Expire {
            key: key.to_string(),
            ttl_secs,
        });
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> BananasResult<Vec<Option<String>>> {
        let mut state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| {
                state.purge_expired(key);
                state.strings.get(key).cloned()
            })
            .collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::LPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        self.writes.notify_waiters();
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::RPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        self.writes.notify_waiters();
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> BananasResult<u64> {
        Ok(self.state.lock().lrem(key, count, value))
    }

    async fn llen(&self, key: &str) -> BananasResult<u64> {
        Ok(self
            .state
            .lock()
            .lists
            .get(key)
            .map_or(0, |list| list.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> BananasResult<Vec<String>> {
        let state = self.state.lock();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let normalize = |index: i64| -> i64 {
            if index < 0 {
                (len + index).max(0)
            } else {
                index
            }
        };
        let start = normalize(start);
        let stop = normalize(stop).min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn brpoplpush(
        &self,
        sources: &[String],
        dest: &str,
        timeout: Duration,
    ) -> BananasResult<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wakeups before scanning so a concurrent push
            // between the scan and the wait is not missed.
            let notified = self.writes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_move(sources, dest) {
                return Ok(Some(value));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.try_move(sources, dest));
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn zrangebyscore_upto(&self, key: &str, max: f64) -> BananasResult<Vec<String>> {
        let state = self.state.lock();
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<(String, f64)> = set
            .iter()
            .filter(|(_, score)| *score <= max)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(matching.into_iter().map(|(member, _)| member).collect())
    }

    async fn zcard(&self, key: &str) -> BananasResult<u64> {
        Ok(self
            .state
            .lock()
            .zsets
            .get(key)
            .map_or(0, |set| set.len() as u64))
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> BananasResult<()> {
        self.state.lock().apply(&StoreOp::HSet {
            key: key.to_string(),
            fields: fields.to_vec(),
        });
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> BananasResult<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> BananasResult<i64> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn publish(&self, channel: &str, message: &str) -> BananasResult<()> {
        self.state.lock().publish(channel, message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BananasResult<Subscription> {
        let mut broadcast_rx = {
            let mut state = self.state.lock();
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(16).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = broadcast_rx.recv() => {
                        match msg {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> BananasResult<bool> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        if state.strings.get(key).map(String::as_str) == Some(token) {
            state.strings.remove(key);
            state.expirations.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> BananasResult<()> {
        {
            let mut state = self.state.lock();
            for op in &ops {
                state.apply(op);
            }
        }
        self.writes.notify_waiters();
        Ok(())
    }

    async fn ping(&self) -> BananasResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_push_pop_order() {
        let store = MemoryStore::new();
        store.lpush("q", "a").await.unwrap();
        store.lpush("q", "b").await.unwrap();

        // rpoplpush consumes the oldest element first.
        let moved = store
            .brpoplpush(&["q".to_string()], "p", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some("a"));
        assert_eq!(store.llen("p").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_move_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = store.clone();

        let handle = tokio::spawn(async move {
            waiter
                .brpoplpush(&["q".to_string()], "p", Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.lpush("q", "x").await.unwrap();

        let moved = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(moved.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn blocking_move_times_out() {
        let store = MemoryStore::new();
        let moved = store
            .brpoplpush(&["empty".to_string()], "p", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(moved, None);
    }

    #[tokio::test]
    async fn source_order_is_respected() {
        let store = MemoryStore::new();
        store.lpush("low", "l1").await.unwrap();
        store.lpush("high", "h1").await.unwrap();

        let sources = vec!["high".to_string(), "low".to_string()];
        let first = store
            .brpoplpush(&sources, "p", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("h1"));

        let second = store
            .brpoplpush(&sources, "p", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("l1"));
    }

    #[tokio::test]
    async fn set_nx_and_compare_delete() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", "tok-1", 60).await.unwrap());
        assert!(!store.set_nx_ex("lock", "tok-2", 60).await.unwrap());

        assert!(!store.compare_and_delete("lock", "tok-2").await.unwrap());
        assert!(store.compare_and_delete("lock", "tok-1").await.unwrap());
        assert!(store.set_nx_ex("lock", "tok-2", 60).await.unwrap());
    }

    #[tokio::test]
    async fn pubsub_fan_out() {
        let store = MemoryStore::new();
        let mut sub_a = store.subscribe("chan").await.unwrap();
        let mut sub_b = store.subscribe("chan").await.unwrap();

        store.publish("chan", "ready").await.unwrap();

        assert_eq!(sub_a.recv().await.as_deref(), Some("ready"));
        assert_eq!(sub_b.recv().await.as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn zset_range_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 300.0).await.unwrap();
        store.zadd("z", "early", 100.0).await.unwrap();
        store.zadd("z", "mid", 200.0).await.unwrap();

        let due = store.zrangebyscore_upto("z", 250.0).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "mid".to_string()]);
    }
}
