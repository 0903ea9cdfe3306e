//! In-process [`StoreOps`] double.
//!
//! `MemoryStore` backs every multi-key mutation with one `Mutex`-guarded
//! state machine, so it reproduces the exact atomicity the Lua scripts
//! give `RedisStore` without needing a running Redis. It drives this
//! crate's own unit/property/integration tests and is exported for
//! downstream integration tests behind the `test-util` feature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{PromoteItem, RepairItem, RepairRoute, StoreOps};

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    /// value plus an optional absolute expiry (in the injected clock's
    /// unix-seconds domain); `None` means no TTL (plain `SET`/`SETNX`).
    strings: HashMap<String, (String, Option<i64>)>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
    }
}

fn string_live(entry: &(String, Option<i64>), now: i64) -> bool {
    match entry.1 {
        Some(expires_at) => expires_at > now,
        None => true,
    }
}

#[async_trait]
impl StoreOps for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let s = self.state.lock().unwrap();
        Ok(s.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(h) = s.hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let s = self.state.lock().unwrap();
        Ok(s.hashes.get(key).map(|h| h.contains_key(field)).unwrap_or(false))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut s = self.state.lock().unwrap();
        let list = s.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as i64)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let s = self.state.lock().unwrap();
        Ok(s.lists.get(key).map(|l| l.len()).unwrap_or(0) as i64)
    }

    async fn sadd(&self, key: &str, value: &str) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        Ok(s.sets.entry(key.to_string()).or_default().insert(value.to_string()))
    }

    async fn srem(&self, key: &str, value: &str) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        Ok(s.sets.get_mut(key).map(|set| set.remove(value)).unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        let s = self.state.lock().unwrap();
        Ok(s.sets.get(key).map(|set| set.len()).unwrap_or(0) as i64)
    }

    async fn smembers_sample(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let s = self.state.lock().unwrap();
        Ok(s.sets
            .get(key)
            .map(|set| set.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        Ok(s.zsets.get_mut(key).map(|z| z.remove(member).is_some()).unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let s = self.state.lock().unwrap();
        Ok(s.zsets.get(key).map(|z| z.len()).unwrap_or(0) as i64)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let s = self.state.lock().unwrap();
        let Some(z) = s.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &f64)> =
            z.iter().filter(|(_, score)| **score >= min && **score <= max).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(a.0.cmp(b.0)));
        Ok(entries.into_iter().take(limit).map(|(id, _)| id.clone()).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let s = self.state.lock().unwrap();
        Ok(s.strings
            .get(key)
            .filter(|e| string_live(e, now))
            .map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.strings.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn setnx(&self, key: &str, value: &str) -> Result<bool> {
        let now = self.now();
        let mut s = self.state.lock().unwrap();
        let occupied = s.strings.get(key).map(|e| string_live(e, now)).unwrap_or(false);
        if occupied {
            Ok(false)
        } else {
            s.strings.insert(key.to_string(), (value.to_string(), None));
            Ok(true)
        }
    }

    async fn setex(&self, key: &str, seconds: i64, value: &str) -> Result<()> {
        let now = self.now();
        let mut s = self.state.lock().unwrap();
        s.strings
            .insert(key.to_string(), (value.to_string(), Some(now + seconds.max(0))));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        let had_string = s.strings.remove(key).is_some();
        let had_hash = s.hashes.remove(key).is_some();
        let had_list = s.lists.remove(key).is_some();
        let had_set = s.sets.remove(key).is_some();
        let had_zset = s.zsets.remove(key).is_some();
        Ok(had_string || had_hash || had_list || had_set || had_zset)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.now();
        let s = self.state.lock().unwrap();
        Ok(s.strings.get(key).map(|e| string_live(e, now)).unwrap_or(false))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        let now = self.now();
        let s = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .map(|k| s.strings.get(k).map(|e| string_live(e, now)).unwrap_or(false))
            .collect())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut s = self.state.lock().unwrap();
        let entry = s.strings.entry(key.to_string()).or_insert((String::from("0"), None));
        let next: i64 = entry.0.parse().unwrap_or(0) + 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn eval_claim_pop(&self, pending_key: &str, inprog_key: &str) -> Result<Option<String>> {
        let mut s = self.state.lock().unwrap();
        let Some(id) = s.lists.get_mut(pending_key).and_then(|l| l.pop_back()) else {
            return Ok(None);
        };
        s.sets.entry(inprog_key.to_string()).or_default().insert(id.clone());
        Ok(Some(id))
    }

    async fn eval_repair_batch(&self, inprog_key: &str, items: &[RepairItem]) -> Result<i64> {
        let mut s = self.state.lock().unwrap();
        let mut processed = 0i64;
        for item in items {
            let removed = s
                .sets
                .get_mut(inprog_key)
                .map(|set| set.remove(&item.task_id))
                .unwrap_or(false);
            if !removed {
                continue;
            }
            match &item.route {
                RepairRoute::Delay { delayed_key, score } => {
                    s.zsets
                        .entry(delayed_key.clone())
                        .or_default()
                        .insert(item.task_id.clone(), *score);
                }
                RepairRoute::Dlq { dlq_key } => {
                    s.sets.entry(dlq_key.clone()).or_default().insert(item.task_id.clone());
                }
            }
            processed += 1;
        }
        Ok(processed)
    }

    async fn eval_promote_batch(&self, delayed_key: &str, items: &[PromoteItem]) -> Result<i64> {
        let mut s = self.state.lock().unwrap();
        let mut processed = 0i64;
        for item in items {
            let removed = s
                .zsets
                .get_mut(delayed_key)
                .map(|z| z.remove(&item.task_id).is_some())
                .unwrap_or(false);
            if !removed {
                continue;
            }
            s.lists
                .entry(item.pending_key.clone())
                .or_default()
                .push_front(item.task_id.clone());
            processed += 1;
        }
        Ok(processed)
    }

    async fn eval_terminal_dispatch(
        &self,
        inprog_key: &str,
        lease_key: &str,
        tasks_key: &str,
        task_id: &str,
        task_json: &str,
    ) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(set) = s.sets.get_mut(inprog_key) {
            set.remove(task_id);
        }
        s.strings.remove(lease_key);
        s.hashes
            .entry(tasks_key.to_string())
            .or_default()
            .insert(task_id.to_string(), task_json.to_string());
        Ok(())
    }
}
