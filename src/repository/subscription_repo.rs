//! C6 — the subscription repository: advisory webhook subscriptions (spec
//! §4.6). Delivery itself is out of scope; this module only tracks who is
//! listening, throttles repeat notifications, and picks one subscriber per
//! group for `Group` delivery mode.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::Subscription;
use crate::store::StoreOps;

const DEFAULT_TTL_SECONDS: i64 = 300;
const DEFAULT_MIN_INTERVAL_SECONDS: u64 = 5;
const LIST_ACTIVE_LIMIT: usize = 1000;

pub struct SubscriptionRepository {
    store: Arc<dyn StoreOps>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionRepository {
    pub fn new(store: Arc<dyn StoreOps>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
    }

    async fn load(&self, id: &str) -> Result<Option<Subscription>> {
        let raw = self.store.hget(keys::subs(), id).await?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                tracing::error!(sub_id = %id, error = %e, "corrupt subscription record");
                Error::Internal(format!("corrupt subscription record {id}: {e}"))
            }),
        }
    }

    async fn persist(&self, sub: &Subscription) -> Result<()> {
        let json = serde_json::to_string(sub)
            .map_err(|e| Error::Internal(format!("failed to serialize subscription {}: {e}", sub.id)))?;
        self.store.hset(keys::subs(), &sub.id, &json).await?;
        for event_type in &sub.event_types {
            self.store
                .zadd(&keys::subs_for_command(event_type), &sub.id, sub.expires_at as f64)
                .await?;
        }
        Ok(())
    }

    /// Assigns an id when `sub.id` is empty, stamps `createdAt`/`expiresAt`,
    /// and applies the min-interval default. All writes (map + per-event
    /// zsets) happen in one logical pipeline — there's no cross-key
    /// invariant that needs a Lua script here, unlike the task queues.
    pub async fn create(&self, mut sub: Subscription, ttl_seconds: i64) -> Result<Subscription> {
        if sub.id.is_empty() {
            sub.id = Uuid::new_v4().to_string();
        }
        let ttl = if ttl_seconds == 0 { DEFAULT_TTL_SECONDS } else { ttl_seconds };
        let now = self.now();
        sub.created_at = now;
        sub.expires_at = now + ttl;
        if sub.min_interval_seconds == 0 {
            sub.min_interval_seconds = DEFAULT_MIN_INTERVAL_SECONDS;
        }
        self.persist(&sub).await?;
        tracing::debug!(sub_id = %sub.id, event_types = ?sub.event_types, "subscription created");
        Ok(sub)
    }

    pub async fn heartbeat(&self, id: &str, ttl_seconds: i64) -> Result<Subscription> {
        let Some(mut sub) = self.load(id).await? else {
            return Err(Error::not_found("subscription", id));
        };
        let ttl = if ttl_seconds == 0 { DEFAULT_TTL_SECONDS } else { ttl_seconds };
        sub.expires_at = self.now() + ttl;
        self.persist(&sub).await?;
        Ok(sub)
    }

    /// Eagerly `ZREM`s any id found dead or expired along the way, so a
    /// crashed subscriber that never heartbeats again gets swept out of the
    /// per-command index the first time anyone lists it, not just on the
    /// periodic [`Self::cleanup_expired`] sweep.
    pub async fn list_active(&self, command: &str) -> Result<Vec<Subscription>> {
        let now = self.now();
        let key = keys::subs_for_command(command);
        let ids = self
            .store
            .zrangebyscore(&key, now as f64, f64::INFINITY, LIST_ACTIVE_LIMIT)
            .await?;

        let mut alive = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await? {
                Some(sub) if !sub.is_expired(now) => alive.push(sub),
                _ => {
                    self.store.zrem(&key, &id).await?;
                }
            }
        }
        Ok(alive)
    }

    /// `SET key val NX EX ttl` expressed as the two primitives this store
    /// exposes: an existence probe plus `setex`. The race between the two
    /// (another caller's `setex` lands in between) only ever narrows the
    /// throttle window, never widens it, which is the safe direction for a
    /// best-effort notification throttle.
    pub async fn allow_notify(&self, sub_id: &str, min_interval_seconds: u64) -> Result<bool> {
        let key = keys::subs_last(sub_id);
        if self.store.exists(&key).await? {
            return Ok(false);
        }
        self.store.setex(&key, min_interval_seconds as i64, "1").await?;
        Ok(true)
    }

    /// Stable round-robin index in `[0, modulo)`. `modulo == 0` means no
    /// subscribers are in the group; returns 0 rather than dividing by zero.
    pub async fn next_group_index(&self, command: &str, group_id: &str, modulo: u64) -> Result<u64> {
        if modulo == 0 {
            return Ok(0);
        }
        let counter = self.store.incr(&keys::subs_rr(command, group_id)).await?;
        Ok((counter as u64 - 1) % modulo)
    }

    /// Sweeps the per-command zsets named in `commands` for scores ≤
    /// `before`, re-verifies each candidate's actual expiry against the
    /// `subs` map (a zset score could be stale if a heartbeat raced the
    /// sweep), and removes confirmed-expired subscriptions from the map,
    /// every per-command zset they were indexed under, and their throttle
    /// key. Returns the number of subscriptions removed.
    pub async fn cleanup_expired(&self, commands: &[String], limit: usize, before: i64) -> Result<usize> {
        let now = self.now();
        let mut removed = 0usize;
        for command in commands {
            let key = keys::subs_for_command(command);
            let candidates = self
                .store
                .zrangebyscore(&key, f64::NEG_INFINITY, before as f64, limit)
                .await?;
            for id in candidates {
                let Some(sub) = self.load(&id).await? else {
                    self.store.zrem(&key, &id).await?;
                    continue;
                };
                if !sub.is_expired(now) {
                    continue;
                }
                for event_type in &sub.event_types {
                    self.store.zrem(&keys::subs_for_command(event_type), &id).await?;
                }
                self.store.hdel(keys::subs(), &id).await?;
                self.store.del(&keys::subs_last(&id)).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired subscriptions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::model::DeliveryMode;
    use crate::store::memory::MemoryStore;

    fn sample(event_types: &[&str]) -> Subscription {
        Subscription {
            id: String::new(),
            callback_url: "https://example.com/hook".into(),
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            delivery_mode: DeliveryMode::Fanout,
            group_id: None,
            min_interval_seconds: 0,
            created_at: 0,
            expires_at: 0,
        }
    }

    fn repo_with(clock: Arc<TestClock>) -> SubscriptionRepository {
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        SubscriptionRepository::new(store, clock)
    }

    #[tokio::test]
    async fn create_assigns_id_and_applies_defaults() {
        let repo = repo_with(TestClock::new(1_000));
        let sub = repo.create(sample(&["echo"]), 0).await.unwrap();
        assert!(!sub.id.is_empty());
        assert_eq!(sub.expires_at, 1_000 + DEFAULT_TTL_SECONDS as i64);
        assert_eq!(sub.min_interval_seconds, DEFAULT_MIN_INTERVAL_SECONDS);
    }

    #[tokio::test]
    async fn list_active_excludes_expired_and_sweeps_them() {
        let clock = TestClock::new(0);
        let repo = repo_with(clock.clone());
        let sub = repo.create(sample(&["echo"]), 10).await.unwrap();

        assert_eq!(repo.list_active("echo").await.unwrap().len(), 1);

        clock.advance(11);
        assert!(repo.list_active("echo").await.unwrap().is_empty());

        let key = keys::subs_for_command("echo");
        let remaining = repo.store.zrangebyscore(&key, 0.0, f64::INFINITY, 10).await.unwrap();
        assert!(!remaining.contains(&sub.id));
    }

    #[tokio::test]
    async fn heartbeat_extends_expiry() {
        let clock = TestClock::new(0);
        let repo = repo_with(clock.clone());
        let sub = repo.create(sample(&["echo"]), 5).await.unwrap();
        clock.advance(4);
        let refreshed = repo.heartbeat(&sub.id, 5).await.unwrap();
        assert_eq!(refreshed.expires_at, 9);
        clock.advance(4);
        assert_eq!(repo.list_active("echo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn allow_notify_throttles_within_interval() {
        let repo = repo_with(TestClock::new(0));
        assert!(repo.allow_notify("sub-1", 5).await.unwrap());
        assert!(!repo.allow_notify("sub-1", 5).await.unwrap());
    }

    #[tokio::test]
    async fn next_group_index_rotates_modulo_subscriber_count() {
        let repo = repo_with(TestClock::new(0));
        let first = repo.next_group_index("echo", "team-a", 3).await.unwrap();
        let second = repo.next_group_index("echo", "team-a", 3).await.unwrap();
        let third = repo.next_group_index("echo", "team-a", 3).await.unwrap();
        let fourth = repo.next_group_index("echo", "team-a", 3).await.unwrap();
        assert_eq!([first, second, third, fourth], [0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_map_entry_and_throttle_key() {
        let clock = TestClock::new(0);
        let repo = repo_with(clock.clone());
        let sub = repo.create(sample(&["echo"]), 5).await.unwrap();
        repo.allow_notify(&sub.id, 5).await.unwrap();
        clock.advance(10);

        let removed = repo
            .cleanup_expired(&["echo".to_string()], 100, clock.now_unix())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.load(&sub.id).await.unwrap().is_none());
        assert!(!repo.store.exists(&keys::subs_last(&sub.id)).await.unwrap());
    }
}
