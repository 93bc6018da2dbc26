//! Redis store implementation, the canonical backend.

use super::{StoreOp, Subscription};
use crate::config::StoreConfig;
use crate::error::{BananasError, BananasResult};
use crate::store::Store;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Lua scan over the source lists: RPOPLPUSH the first non-empty source
/// into the destination (the last KEYS entry) in one atomic round trip.
const SCAN_SOURCES_SCRIPT: &str = r#"
    local dest = KEYS[#KEYS]
    for i = 1, #KEYS - 1 do
        local v = redis.call('RPOPLPUSH', KEYS[i], dest)
        if v then
            return v
        end
    end
    return false
"#;

/// Compare-and-delete used for lock release.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// When blocking across several sources, block on the front source in
/// bounded slices so pushes to the other sources are picked up promptly.
const MULTI_SOURCE_BLOCK_SLICE: Duration = Duration::from_secs(1);

/// Redis-backed [`Store`].
///
/// Uses a deadpool connection pool for commands and pipelines, and a
/// dedicated client connection per pub/sub subscription.
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with a PING.
    pub async fn connect(config: &StoreConfig) -> BananasResult<Self> {
        info!(url = %config.url, pool_size = config.pool_size, "connecting to store");

        let pool = Config::from_url(&config.url)
            .builder()
            .map_err(|e| BananasError::Configuration(format!("invalid store config: {}", e)))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                BananasError::Configuration(format!("failed to create store pool: {}", e))
            })?;

        let client = redis::Client::open(config.url.as_str())?;

        let store = Self { pool, client };
        store.ping().await?;

        info!("store connection established");
        Ok(store)
    }

    async fn conn(&self) -> BananasResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// One atomic scan pass over the sources.
    async fn scan_sources(&self, sources: &[String], dest: &str) -> BananasResult<Option<String>> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(SCAN_SOURCES_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for source in sources {
            invocation.key(source.as_str());
        }
        invocation.key(dest);
        let found: Option<String> = invocation.invoke_async(&mut *conn).await?;
        Ok(found)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> BananasResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BananasResult<bool> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await?;
        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.expire(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> BananasResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(conn.mget(keys).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> BananasResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.lrem(key, count as isize, value).await?)
    }

    async fn llen(&self, key: &str) -> BananasResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> BananasResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn brpoplpush(
        &self,
        sources: &[String],
        dest: &str,
        timeout: Duration,
    ) -> BananasResult<Option<String>> {
        if sources.is_empty() {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;

        loop {
            if let Some(id) = self.scan_sources(sources, dest).await? {
                return Ok(Some(id));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            // All sources were empty; block server-side on the front source.
            // With a single source the block spans the whole remaining
            // timeout; with several it is sliced so the scan above re-checks
            // the lower-preference sources.
            let slice = if sources.len() == 1 {
                remaining
            } else {
                remaining.min(MULTI_SOURCE_BLOCK_SLICE)
            };

            let mut conn = self.conn().await?;
            let popped: Option<String> = conn
                .brpoplpush(&sources[0], dest, slice.as_secs_f64())
                .await?;
            if popped.is_some() {
                return Ok(popped);
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zrangebyscore_upto(&self, key: &str, max: f64) -> BananasResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrangebyscore(key, "-inf", max).await?)
    }

    async fn zcard(&self, key: &str) -> BananasResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> BananasResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> BananasResult<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BananasResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(16);
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else { break };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(_) => continue,
                        };
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            debug!(channel = %channel, "subscription closed");
        });

        Ok(Subscription::new(rx))
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> BananasResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i32 = redis::Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> BananasResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                StoreOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                StoreOp::SetEx {
                    key,
                    value,
                    ttl_secs,
                } => {
                    pipe.set_ex(key, value, *ttl_secs).ignore();
                }
                StoreOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                StoreOp::Expire { key, ttl_secs } => {
                    pipe.expire(key, *ttl_secs as i64).ignore();
                }
                StoreOp::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                StoreOp::RPush { key, value } => {
                    pipe.rpush(key, value).ignore();
                }
                StoreOp::LRem { key, count, value } => {
                    pipe.lrem(key, *count as isize, value).ignore();
                }
                StoreOp::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreOp::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                StoreOp::HSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                StoreOp::Publish { channel, message } => {
                    pipe.publish(channel, message).ignore();
                }
            }
        }

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn ping(&self) -> BananasResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
