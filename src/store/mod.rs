//! The store capability interface (spec §9 "Polymorphism", §6 "Store
//! contract"). `StoreOps` is the seam the repositories (C4-C6) are
//! generic over; [`redis_store::RedisStore`] is the production
//! implementation and [`memory::MemoryStore`] is an in-process double with
//! identical atomicity guarantees, used by this crate's own test suite.

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::error::Result;

/// One candidate considered during claim-time lease-expiry repair (spec
/// §4.4.1 step 1b). The route is decided in Rust (it depends on the
/// loaded task's `attempts`/`max_attempts`), then handed to the store as
/// a single batched atomic move — the second of the three Lua scripts
/// named in spec §6.
#[derive(Debug, Clone)]
pub struct RepairItem {
    pub task_id: String,
    pub route: RepairRoute,
}

#[derive(Debug, Clone)]
pub enum RepairRoute {
    /// Move from `inprog` to `delayed` with the given due-at score.
    Delay { delayed_key: String, score: f64 },
    /// Move from `inprog` straight to `dlq` (attempts exhausted).
    Dlq { dlq_key: String },
}

/// One candidate promoted from `delayed` to its priority-tiered `pending`
/// list (spec §4.4.1 step 1a / `MoveDueDelayed`).
#[derive(Debug, Clone)]
pub struct PromoteItem {
    pub task_id: String,
    pub pending_key: String,
}

/// Capability interface over a Redis-shaped key/value store (spec §6).
/// Every method maps either to a handful of plain commands (safe to
/// pipeline, never multi-key-atomic) or to one of the three committed Lua
/// scripts (the `eval_*` methods), which are the engine's only multi-key
/// critical sections.
#[async_trait]
pub trait StoreOps: Send + Sync {
    // -- hash ops (tasks / results side indexes) --------------------------
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool>;

    // -- list ops (priority-tiered pending queues) -------------------------
    //
    // Every insertion into a `pending:<p>` list — whether from Enqueue,
    // due-delayed promotion, or Abandon — uses `LPUSH`; `ClaimTask` always
    // drains with `RPOP` (inside `eval_claim_pop`). That single
    // LPUSH-in/RPOP-out discipline is what gives the FIFO-within-tier
    // invariant (spec §3 invariant 6) for free, regardless of which
    // operation performed the insertion.
    async fn lpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn llen(&self, key: &str) -> Result<i64>;

    // -- set ops (inprog / dlq membership) ----------------------------------
    async fn sadd(&self, key: &str, value: &str) -> Result<bool>;
    async fn srem(&self, key: &str, value: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<i64>;
    async fn smembers_sample(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    // -- sorted set ops (delayed queue, ttl index, subs expiry) -------------
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zcard(&self, key: &str) -> Result<i64>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>>;

    // -- string / ttl ops ----------------------------------------------------
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn setnx(&self, key: &str, value: &str) -> Result<bool>;
    async fn setex(&self, key: &str, seconds: i64, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Pipelined batch existence check — used by the repair phase to test
    /// many `lease:<id>` keys in a single round-trip (spec §4.4.1 step 1b).
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>>;
    async fn incr(&self, key: &str) -> Result<i64>;

    // -- the three committed Lua scripts (spec §6) --------------------------

    /// Script 1: atomic claim move. `RPOP pending`; if non-nil, `SADD
    /// inprog`. Returns the popped id, or `None` if pending was empty.
    async fn eval_claim_pop(&self, pending_key: &str, inprog_key: &str) -> Result<Option<String>>;

    /// Script 2: claim-time lease-expiry repair batch. For each item:
    /// `SREM inprog`, then either `ZADD delayed` or `SADD dlq` per its
    /// route. Returns the number of items processed.
    async fn eval_repair_batch(&self, inprog_key: &str, items: &[RepairItem]) -> Result<i64>;

    /// Due-delayed promotion batch used by both claim-time repair and
    /// `MoveDueDelayed`: for each item, `ZREM delayed`, `LPUSH` onto its
    /// priority-tiered pending key. Returns the number promoted.
    async fn eval_promote_batch(&self, delayed_key: &str, items: &[PromoteItem]) -> Result<i64>;

    /// Script 3: terminal dispatch bundling — `SREM inprog`, `DEL lease`,
    /// `HSET tasks` in one round trip.
    async fn eval_terminal_dispatch(
        &self,
        inprog_key: &str,
        lease_key: &str,
        tasks_key: &str,
        task_id: &str,
        task_json: &str,
    ) -> Result<()>;
}
