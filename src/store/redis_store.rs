//! Production [`StoreOps`] backed by Redis.
//!
//! Everything outside the three committed scripts is a single plain
//! command against an async [`ConnectionManager`] (it reconnects and
//! retries internally; [`RedisStore::connect`] only needs to retry the
//! *first* connection, the way the teacher worker's `connect_with_backoff`
//! retries `Client::get_connection`). The three multi-key critical
//! sections are `redis::Script` bodies, loaded once and cached server-side
//! by SHA so repeated invocations are a single `EVALSHA` round trip.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::{Error, Result};
use crate::store::{PromoteItem, RepairItem, RepairRoute, StoreOps};

const CLAIM_POP_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
  return false
end
redis.call('SADD', KEYS[2], id)
return id
"#;

/// `ARGV` is a flat run of `(task_id, kind, target_key[, score])` tuples,
/// `kind` is `"D"` (delayed) or `"Q"` (dlq). Keyed only by `inprog_key`
/// because the repair batch for a single claim call always shares one
/// command/tenant `inprog` set; the per-item target keys travel in `ARGV`
/// rather than `KEYS` (this engine targets a single Redis instance, not a
/// cluster with per-key slot routing).
const REPAIR_BATCH_SCRIPT: &str = r#"
local inprog_key = KEYS[1]
local n = 0
local i = 1
while ARGV[i] do
  local id = ARGV[i]
  local kind = ARGV[i + 1]
  local target = ARGV[i + 2]
  if redis.call('SREM', inprog_key, id) == 1 then
    if kind == 'D' then
      redis.call('ZADD', target, ARGV[i + 3], id)
    else
      redis.call('SADD', target, id)
    end
    n = n + 1
  end
  if kind == 'D' then
    i = i + 4
  else
    i = i + 3
  end
end
return n
"#;

/// `ARGV` is a flat run of `(task_id, pending_key)` pairs, all promoted
/// out of the single `delayed_key` passed in `KEYS[1]`.
const PROMOTE_BATCH_SCRIPT: &str = r#"
local delayed_key = KEYS[1]
local n = 0
local i = 1
while ARGV[i] do
  local id = ARGV[i]
  local target = ARGV[i + 1]
  if redis.call('ZREM', delayed_key, id) == 1 then
    redis.call('LPUSH', target, id)
    n = n + 1
  end
  i = i + 2
end
return n
"#;

const TERMINAL_DISPATCH_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
return 1
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    claim_pop: Script,
    repair_batch: Script,
    promote_batch: Script,
    terminal_dispatch: Script,
}

impl RedisStore {
    /// Opens `addr` (a `redis://` URL) and retries the initial handshake
    /// with capped exponential backoff, mirroring the teacher worker's
    /// `connect_with_backoff`. Once established, `ConnectionManager`
    /// reconnects transparently on its own, so no further retry wrapper is
    /// needed past startup.
    pub async fn connect(addr: &str, attempts: u32) -> Result<Self> {
        let client = redis::Client::open(addr)?;
        let mut delay = Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            match client.get_connection_manager().await {
                Ok(conn) => return Ok(Self::from_connection_manager(conn)),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "redis connection attempt failed, retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        Err(Error::Transport(last_err.expect("attempts.max(1) guarantees at least one try")))
    }

    fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            claim_pop: Script::new(CLAIM_POP_SCRIPT),
            repair_batch: Script::new(REPAIR_BATCH_SCRIPT),
            promote_batch: Script::new(PROMOTE_BATCH_SCRIPT),
            terminal_dispatch: Script::new(TERMINAL_DISPATCH_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl StoreOps for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.conn().hset(key, field, value).await.map_err(Error::from)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.conn().hget(key, field).await.map_err(Error::from)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.conn().hdel(key, field).await.map_err(Error::from)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        self.conn().hexists(key, field).await.map_err(Error::from)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        self.conn().lpush(key, value).await.map_err(Error::from)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        self.conn().llen(key).await.map_err(Error::from)
    }

    async fn sadd(&self, key: &str, value: &str) -> Result<bool> {
        self.conn().sadd(key, value).await.map_err(Error::from)
    }

    async fn srem(&self, key: &str, value: &str) -> Result<bool> {
        self.conn().srem(key, value).await.map_err(Error::from)
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        self.conn().scard(key).await.map_err(Error::from)
    }

    async fn smembers_sample(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        // SSCAN with a COUNT hint rather than SMEMBERS: inprog/dlq sets can
        // grow large and a full SMEMBERS would block the server.
        let mut conn = self.conn();
        let (_cursor, members): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(key)
            .arg(0)
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(members.into_iter().take(limit).collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.conn().zadd(key, member, score).await.map_err(Error::from)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.conn().zrem(key, member).await.map_err(Error::from)
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        self.conn().zcard(key).await.map_err(Error::from)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.conn()
            .zrangebyscore_limit(key, min, max, 0, limit as isize)
            .await
            .map_err(Error::from)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn().get(key).await.map_err(Error::from)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().set(key, value).await.map_err(Error::from)
    }

    async fn setnx(&self, key: &str, value: &str) -> Result<bool> {
        self.conn().set_nx(key, value).await.map_err(Error::from)
    }

    async fn setex(&self, key: &str, seconds: i64, value: &str) -> Result<()> {
        let seconds = seconds.max(0) as u64;
        self.conn().set_ex(key, value, seconds).await.map_err(Error::from)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(key).await.map_err(Error::from)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.conn().exists(key).await.map_err(Error::from)
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.exists(key);
        }
        let mut conn = self.conn();
        pipe.query_async(&mut conn).await.map_err(Error::from)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.conn().incr(key, 1).await.map_err(Error::from)
    }

    async fn eval_claim_pop(&self, pending_key: &str, inprog_key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let result: redis::Value = self
            .claim_pop
            .key(pending_key)
            .key(inprog_key)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        match result {
            redis::Value::BulkString(bytes) => {
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            redis::Value::SimpleString(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    async fn eval_repair_batch(&self, inprog_key: &str, items: &[RepairItem]) -> Result<i64> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.repair_batch.key(inprog_key);
        for item in items {
            invocation = invocation.arg(&item.task_id);
            match &item.route {
                RepairRoute::Delay { delayed_key, score } => {
                    invocation = invocation.arg("D").arg(delayed_key).arg(score);
                }
                RepairRoute::Dlq { dlq_key } => {
                    invocation = invocation.arg("Q").arg(dlq_key);
                }
            }
        }
        let mut conn = self.conn();
        invocation.invoke_async(&mut conn).await.map_err(Error::from)
    }

    async fn eval_promote_batch(&self, delayed_key: &str, items: &[PromoteItem]) -> Result<i64> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.promote_batch.key(delayed_key);
        for item in items {
            invocation = invocation.arg(&item.task_id).arg(&item.pending_key);
        }
        let mut conn = self.conn();
        invocation.invoke_async(&mut conn).await.map_err(Error::from)
    }

    async fn eval_terminal_dispatch(
        &self,
        inprog_key: &str,
        lease_key: &str,
        tasks_key: &str,
        task_id: &str,
        task_json: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .terminal_dispatch
            .key(inprog_key)
            .key(lease_key)
            .key(tasks_key)
            .arg(task_id)
            .arg(task_json)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
