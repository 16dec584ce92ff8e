//! Typed facade over the key/value + pub/sub store.
//!
//! Every operation the core needs is expressed as a single command or a
//! best-effort pipeline; nothing here relies on server-side transactions
//! across unrelated keys. The facade is cheap to clone - all clones share
//! one multiplexed connection, while pub/sub subscriptions get a dedicated
//! connection each.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Initial connection to the store failed.
    #[error("store connection failed: {0}")]
    Connect(String),

    /// A command failed after the connection was established.
    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),
}

/// Convenient Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Page size used when scanning key prefixes (e.g. during nest deletion).
pub const SCAN_PAGE_SIZE: usize = 200;

/// Shared handle to the backing store.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    conn: ConnectionManager,
}

impl Store {
    /// Connects to the store at the given URL (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connect(e.to_string()))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Strings
    // ─────────────────────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        Ok(self.conn().set(key, value).await?)
    }

    /// Sets a value with an expiry. TTLs below one second are clamped up.
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let secs = ttl.as_secs().max(1);
        Ok(self.conn().set_ex(key, value, secs).await?)
    }

    /// Sets a value only if the key does not exist. Returns whether it was set.
    pub async fn set_nx(&self, key: &str, value: &str) -> StoreResult<bool> {
        Ok(self.conn().set_nx(key, value).await?)
    }

    pub async fn del(&self, key: &str) -> StoreResult<()> {
        Ok(self.conn().del(key).await?)
    }

    pub async fn del_many(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        Ok(self.conn().del(keys).await?)
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.conn().exists(key).await?)
    }

    /// Atomically increments an integer key, returning the new value.
    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        Ok(self.conn().incr(key, 1i64).await?)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let secs = ttl.as_secs().max(1) as i64;
        Ok(self.conn().expire(key, secs).await?)
    }

    /// Remaining TTL in seconds: -2 when the key is missing, -1 when it has
    /// no expiry.
    pub async fn ttl(&self, key: &str) -> StoreResult<i64> {
        Ok(self.conn().ttl(key).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hashes
    // ─────────────────────────────────────────────────────────────────────

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        Ok(self.conn().hset(key, field, value).await?)
    }

    pub async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        Ok(self.conn().hset_multiple(key, fields).await?)
    }

    pub async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        Ok(self.conn().hdel(key, field).await?)
    }

    pub async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        Ok(self.conn().hincr(key, field, delta).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sorted sets
    // ─────────────────────────────────────────────────────────────────────

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        Ok(self.conn().zadd(key, member, score).await?)
    }

    pub async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self.conn().zscore(key, member).await?)
    }

    pub async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<i64>> {
        Ok(self.conn().zrank(key, member).await?)
    }

    pub async fn zincr(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        Ok(self.conn().zincr(key, member, delta).await?)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        Ok(self.conn().zrem(key, member).await?)
    }

    pub async fn zcard(&self, key: &str) -> StoreResult<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        Ok(self.conn().zrange(key, start, stop).await?)
    }

    pub async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        Ok(self.conn().zrange_withscores(key, start, stop).await?)
    }

    pub async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        Ok(self.conn().zremrangebyrank(key, start, stop).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sets
    // ─────────────────────────────────────────────────────────────────────

    pub async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        Ok(self.conn().sadd(key, member).await?)
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        Ok(self.conn().srem(key, member).await?)
    }

    pub async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    pub async fn spop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().spop(key).await?)
    }

    pub async fn scard(&self, key: &str) -> StoreResult<u64> {
        Ok(self.conn().scard(key).await?)
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lists
    // ─────────────────────────────────────────────────────────────────────

    pub async fn rpush(&self, key: &str, values: &[String]) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        Ok(self.conn().rpush(key, values).await?)
    }

    pub async fn rpush_one(&self, key: &str, value: &str) -> StoreResult<()> {
        Ok(self.conn().rpush(key, value).await?)
    }

    pub async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().lpop(key, None).await?)
    }

    pub async fn lindex(&self, key: &str, index: isize) -> StoreResult<Option<String>> {
        Ok(self.conn().lindex(key, index).await?)
    }

    pub async fn llen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.conn().llen(key).await?)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scans, bulk delete, pipelines
    // ─────────────────────────────────────────────────────────────────────

    /// Collects every key starting with `prefix`, paging the cursor with
    /// [`SCAN_PAGE_SIZE`] hints so large namespaces never block the store.
    pub async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    /// Non-blocking bulk delete (UNLINK), batched to the scan page size.
    pub async fn unlink(&self, keys: &[String]) -> StoreResult<()> {
        let mut conn = self.conn();
        for chunk in keys.chunks(SCAN_PAGE_SIZE) {
            redis::cmd("UNLINK")
                .arg(chunk)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    /// Runs a non-transactional pipeline, discarding the replies.
    pub async fn exec(&self, pipe: &redis::Pipeline) -> StoreResult<()> {
        let mut conn = self.conn();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pub/sub
    // ─────────────────────────────────────────────────────────────────────

    pub async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        Ok(self.conn().publish(channel, message).await?)
    }

    /// Opens a dedicated pub/sub connection subscribed to one channel.
    ///
    /// Messages are forwarded over a bounded channel; the reader task is
    /// aborted when the returned [`Subscription`] is dropped.
    pub async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("[Store] Dropping undecodable pub/sub payload: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription { rx, task })
    }
}

/// A live pub/sub subscription to a single channel.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Receives the next message, or `None` when the connection is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
