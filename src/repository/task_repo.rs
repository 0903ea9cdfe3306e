//! C4 — the task repository: enqueue, claim (with repair), nack,
//! heartbeat, abandon, due-delayed promotion, retention cleanup, and
//! introspection (spec §4.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::backoff::{self, BackoffPolicy};
use crate::bloom::RotatingBloom;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{LastKnownLocation, Task, TaskStatus};
use crate::rng::{ArcRng, SharedRng};
use crate::store::{PromoteItem, RepairItem, RepairRoute, StoreOps};

pub struct EnqueueOutcome {
    pub task: Task,
    /// `true` iff the target queue transitioned from empty to non-empty,
    /// or the task became immediately due — the signal C7 uses to decide
    /// whether to emit `QueueAvailable` (spec §4.4.1 step 6).
    pub queue_became_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackOutcome {
    pub delay_seconds: i64,
    pub moved_to_dlq: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub delayed: i64,
    pub inprog: i64,
    pub dlq: i64,
}

pub struct TaskRepository {
    store: Arc<dyn StoreOps>,
    clock: Arc<dyn Clock>,
    rng: Arc<SharedRng>,
    ghost_bloom: Arc<RotatingBloom>,
    idempotency_bloom: Arc<RotatingBloom>,
    config: EngineConfig,
    /// Starting offset into the caller's `commands` slice for each claim
    /// call's round-robin scan within a priority tier (spec §4.4.1 step 2
    /// "round-robin across commands within a tier to avoid starvation").
    claim_rr: AtomicUsize,
}

impl TaskRepository {
    pub fn new(
        store: Arc<dyn StoreOps>,
        clock: Arc<dyn Clock>,
        rng: Arc<SharedRng>,
        ghost_bloom: Arc<RotatingBloom>,
        idempotency_bloom: Arc<RotatingBloom>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            rng,
            ghost_bloom,
            idempotency_bloom,
            config,
            claim_rr: AtomicUsize::new(0),
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
    }

    fn rng_handle(&self) -> ArcRng {
        ArcRng(self.rng.clone())
    }

    async fn load_task(&self, task_id: &Uuid) -> Result<Option<Task>> {
        let raw = self.store.hget(keys::tasks(), &task_id.to_string()).await?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                tracing::error!(%task_id, error = %e, "corrupt task record");
                Error::Internal(format!("corrupt task record {task_id}: {e}"))
            }),
        }
    }

    async fn persist_task(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_string(task)
            .map_err(|e| Error::Internal(format!("failed to serialize task {}: {e}", task.id)))?;
        self.store.hset(keys::tasks(), &task.id.to_string(), &json).await
    }

    fn require_in_progress_owned(&self, task: &Task, worker_id: &str) -> Result<()> {
        if task.status.is_terminal() {
            return Err(Error::AlreadyTerminal {
                task_id: task.id,
                status: task.status.as_str(),
            });
        }
        if task.status != TaskStatus::InProgress || task.worker_id != worker_id {
            return Err(Error::NotOwner {
                task_id: task.id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    // -- Enqueue -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        command: &str,
        payload: &str,
        priority: u8,
        webhook: Option<String>,
        max_attempts: u32,
        idempotency_key: Option<String>,
        run_at: i64,
    ) -> Result<EnqueueOutcome> {
        let now = self.now();

        if let Some(ref idem_key) = idempotency_key {
            let idem_store_key = keys::idempotency(tenant_id, command, idem_key);
            if self.idempotency_bloom.maybe_present(idem_store_key.as_bytes()) {
                tracing::debug!(%command, idempotency_key = %idem_key, "idempotency bloom probe hit");
                if let Some(existing_id) = self.store.get(&idem_store_key).await? {
                    let existing_uuid: Uuid = existing_id.parse().map_err(|_| {
                        Error::Internal(format!("corrupt idempotency mapping for {idem_store_key}"))
                    })?;
                    if let Some(existing) = self.load_task(&existing_uuid).await? {
                        return Ok(EnqueueOutcome {
                            task: existing,
                            queue_became_available: false,
                        });
                    }
                }
            }
        }

        let id = Uuid::new_v4();
        let delayed = run_at > now;
        let task = Task {
            id,
            tenant_id: tenant_id.to_string(),
            command: command.to_string(),
            payload: payload.to_string(),
            priority,
            status: TaskStatus::Pending,
            worker_id: String::new(),
            lease_until: 0,
            attempts: 0,
            max_attempts: self.config.resolve_max_attempts(max_attempts),
            error: None,
            result_key: None,
            webhook,
            idempotency_key: idempotency_key.clone(),
            visible_at: run_at,
            last_known_location: if delayed {
                LastKnownLocation::Delayed
            } else {
                LastKnownLocation::Pending
            },
            created_at: now,
            updated_at: now,
        };

        self.persist_task(&task).await?;

        if let Some(ref idem_key) = idempotency_key {
            let idem_store_key = keys::idempotency(tenant_id, command, idem_key);
            let won = self.store.setnx(&idem_store_key, &id.to_string()).await?;
            if !won {
                // Someone else raced us to this idempotency key. Discard our
                // write and return theirs.
                self.store.hdel(keys::tasks(), &id.to_string()).await?;
                let existing_id = self.store.get(&idem_store_key).await?.ok_or_else(|| {
                    Error::Conflict(format!("idempotency key {idem_store_key} vanished"))
                })?;
                let existing_uuid: Uuid = existing_id
                    .parse()
                    .map_err(|_| Error::Internal(format!("corrupt idempotency mapping for {idem_store_key}")))?;
                let existing = self.load_task(&existing_uuid).await?.ok_or_else(|| {
                    Error::Conflict(format!("idempotency target task {existing_uuid} missing"))
                })?;
                return Ok(EnqueueOutcome {
                    task: existing,
                    queue_became_available: false,
                });
            }
            self.idempotency_bloom.insert(idem_store_key.as_bytes());
        }

        let queue_became_available = if delayed {
            self.store.zadd(&keys::delayed(command, tenant_id), &id.to_string(), run_at as f64).await?;
            // `delayed` already implies `run_at > now` as sampled above, so
            // this branch is never immediately due; a due delayed task
            // only becomes visible via repair/`MoveDueDelayed`.
            false
        } else {
            let pending_key = keys::pending(command, tenant_id, priority);
            let before = self.store.llen(&pending_key).await?;
            self.store.lpush(&pending_key, &id.to_string()).await?;
            before == 0
        };

        self.store
            .zadd(
                keys::tasks_ttl(),
                &id.to_string(),
                (now + self.config.retention_seconds) as f64,
            )
            .await?;
        self.store.sadd(&keys::commands(tenant_id), command).await?;

        tracing::info!(task_id = %id, %command, tenant_id = %tenant_id, priority, delayed, "task enqueued");
        Ok(EnqueueOutcome { task, queue_became_available })
    }

    // -- Claim -----------------------------------------------------------------

    pub async fn claim(
        &self,
        tenant_id: &str,
        worker_id: &str,
        commands: &[String],
        lease_seconds: i64,
    ) -> Result<Option<Task>> {
        self.repair(tenant_id, commands).await?;

        let now = self.now();
        let start = self.claim_rr.fetch_add(1, Ordering::Relaxed) % commands.len().max(1);

        for priority in (0..=9u8).rev() {
            for offset in 0..commands.len() {
                let command = &commands[(start + offset) % commands.len()];
                if let Some(task) = self.try_claim_one(tenant_id, command, priority, worker_id, lease_seconds, now).await? {
                    return Ok(Some(task));
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_claim_one(
        &self,
        tenant_id: &str,
        command: &str,
        priority: u8,
        worker_id: &str,
        lease_seconds: i64,
        now: i64,
    ) -> Result<Option<Task>> {
        let pending_key = keys::pending(command, tenant_id, priority);
        let inprog_key = keys::inprog(command, tenant_id);

        loop {
            let Some(id_str) = self.store.eval_claim_pop(&pending_key, &inprog_key).await? else {
                tracing::trace!(%command, priority, "pop loop: queue empty");
                return Ok(None);
            };
            tracing::trace!(task_id = %id_str, %command, priority, "pop loop: popped candidate");

            if self.ghost_bloom.maybe_present(id_str.as_bytes()) {
                tracing::warn!(task_id = %id_str, %command, "ghost task detected during claim, elided");
                self.store.srem(&inprog_key, &id_str).await?;
                continue;
            }

            let task_id: Uuid = match id_str.parse() {
                Ok(id) => id,
                Err(_) => {
                    self.store.srem(&inprog_key, &id_str).await?;
                    continue;
                }
            };

            let Some(mut task) = self.load_task(&task_id).await? else {
                tracing::warn!(task_id = %id_str, %command, "ghost task detected during claim, task record missing");
                self.ghost_bloom.insert(id_str.as_bytes());
                self.store.srem(&inprog_key, &id_str).await?;
                continue;
            };

            if task.command != command || task.tenant_id != tenant_id {
                // Self-heal: schema drift, never expected in normal operation.
                self.store.srem(&inprog_key, &id_str).await?;
                self.store.lpush(&pending_key, &id_str).await?;
                continue;
            }

            if task.exhausted() {
                self.route_to_dlq(&mut task, "MAX_ATTEMPTS").await?;
                continue;
            }

            let lease_key = keys::lease(&task.id);
            if let Err(err) = self.store.setex(&lease_key, lease_seconds, worker_id).await {
                let _ = self.store.srem(&inprog_key, &id_str).await;
                return Err(err);
            }

            task.status = TaskStatus::InProgress;
            task.worker_id = worker_id.to_string();
            task.lease_until = now + lease_seconds;
            task.attempts += 1;
            task.updated_at = now;
            task.last_known_location = LastKnownLocation::InProgress;
            self.persist_task(&task).await?;
            tracing::info!(task_id = %task.id, %command, %worker_id, attempts = task.attempts, "task claimed");
            return Ok(Some(task));
        }
    }

    // -- Repair (claim-time) -----------------------------------------------------

    async fn repair(&self, tenant_id: &str, commands: &[String]) -> Result<()> {
        let limit = self.config.requeue_inspect_limit;
        let now = self.now();

        for command in commands {
            self.promote_due_delayed_for_command(tenant_id, command, limit, now).await?;
            self.repair_expired_leases_for_command(tenant_id, command, limit, now).await?;
        }
        Ok(())
    }

    async fn promote_due_delayed_for_command(
        &self,
        tenant_id: &str,
        command: &str,
        limit: usize,
        now: i64,
    ) -> Result<()> {
        let delayed_key = keys::delayed(command, tenant_id);
        let due_ids = self.store.zrangebyscore(&delayed_key, f64::NEG_INFINITY, now as f64, limit).await?;
        if due_ids.is_empty() {
            return Ok(());
        }

        let mut items = Vec::with_capacity(due_ids.len());
        let mut tasks = Vec::with_capacity(due_ids.len());
        for id_str in &due_ids {
            let Ok(task_id) = id_str.parse::<Uuid>() else { continue };
            let Some(task) = self.load_task(&task_id).await? else { continue };
            items.push(PromoteItem {
                task_id: id_str.clone(),
                pending_key: keys::pending(command, tenant_id, task.priority),
            });
            tasks.push(task);
        }

        self.store.eval_promote_batch(&delayed_key, &items).await?;

        for mut task in tasks {
            task.status = TaskStatus::Pending;
            task.last_known_location = LastKnownLocation::Pending;
            task.updated_at = now;
            self.persist_task(&task).await?;
        }
        Ok(())
    }

    async fn repair_expired_leases_for_command(
        &self,
        tenant_id: &str,
        command: &str,
        limit: usize,
        now: i64,
    ) -> Result<()> {
        let inprog_key = keys::inprog(command, tenant_id);
        let sampled = self.store.smembers_sample(&inprog_key, limit).await?;
        if sampled.is_empty() {
            return Ok(());
        }

        let lease_keys: Vec<String> = sampled
            .iter()
            .filter_map(|id| id.parse::<Uuid>().ok())
            .map(|id| keys::lease(&id))
            .collect();
        let live = self.store.exists_many(&lease_keys).await?;

        let mut repair_items = Vec::new();
        let mut tasks_to_persist = Vec::new();

        for (id_str, lease_exists) in sampled.iter().zip(live) {
            if lease_exists {
                continue;
            }
            let Ok(task_id) = id_str.parse::<Uuid>() else { continue };
            let Some(mut task) = self.load_task(&task_id).await? else {
                tracing::warn!(task_id = %id_str, %command, "ghost task detected during lease repair, task record missing");
                self.ghost_bloom.insert(id_str.as_bytes());
                continue;
            };

            // A lease-expiry detection counts as an implicit failed claim
            // attempt (spec §9 adopts "attempts++ at successful claim";
            // an uncompleted claim whose lease silently expired is treated
            // the same way here, since the worker never finished it).
            task.attempts += 1;

            if task.exhausted() {
                tracing::warn!(task_id = %task.id, %command, attempts = task.attempts, "lease expired, attempts exhausted, routing to dlq");
                repair_items.push(RepairItem {
                    task_id: id_str.clone(),
                    route: RepairRoute::Dlq {
                        dlq_key: keys::dlq(command, tenant_id),
                    },
                });
                task.status = TaskStatus::Failed;
                task.error = Some("MAX_ATTEMPTS".to_string());
                task.last_known_location = LastKnownLocation::Dlq;
            } else {
                let mut rng = self.rng_handle();
                let delay = backoff::delay_seconds(
                    task.attempts as i64,
                    self.config.backoff_policy,
                    self.config.backoff_base_seconds,
                    self.config.backoff_max_seconds,
                    &mut rng,
                );
                tracing::warn!(task_id = %task.id, %command, attempts = task.attempts, delay, "lease expired, requeued with backoff");
                repair_items.push(RepairItem {
                    task_id: id_str.clone(),
                    route: RepairRoute::Delay {
                        delayed_key: keys::delayed(command, tenant_id),
                        score: (now + delay) as f64,
                    },
                });
                task.status = TaskStatus::Pending;
                task.worker_id = String::new();
                task.lease_until = 0;
                task.last_known_location = LastKnownLocation::Delayed;
            }
            task.updated_at = now;
            tasks_to_persist.push(task);
        }

        if repair_items.is_empty() {
            return Ok(());
        }
        self.store.eval_repair_batch(&inprog_key, &repair_items).await?;
        for task in tasks_to_persist {
            self.persist_task(&task).await?;
        }
        Ok(())
    }

    // -- Nack / Heartbeat / Abandon ----------------------------------------------

    pub async fn nack(
        &self,
        task_id: Uuid,
        worker_id: &str,
        override_delay_seconds: i64,
        effective_max_attempts: u32,
        reason: Option<String>,
    ) -> Result<NackOutcome> {
        let Some(mut task) = self.load_task(&task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };
        self.require_in_progress_owned(&task, worker_id)?;

        let now = self.now();
        if task.attempts >= effective_max_attempts {
            self.route_to_dlq(&mut task, reason.as_deref().unwrap_or("MAX_ATTEMPTS")).await?;
            return Ok(NackOutcome { delay_seconds: 0, moved_to_dlq: true });
        }

        let delay_seconds = if override_delay_seconds > 0 {
            override_delay_seconds.min(self.config.backoff_max_seconds)
        } else {
            let mut rng = self.rng_handle();
            backoff::delay_seconds(
                task.attempts as i64,
                self.config.backoff_policy,
                self.config.backoff_base_seconds,
                self.config.backoff_max_seconds,
                &mut rng,
            )
        };

        self.route_to_delay(&mut task, delay_seconds, now).await?;
        Ok(NackOutcome { delay_seconds, moved_to_dlq: false })
    }

    async fn route_to_dlq(&self, task: &mut Task, reason: &str) -> Result<()> {
        tracing::warn!(task_id = %task.id, command = %task.command, reason, "task routed to dlq");
        let inprog_key = keys::inprog(&task.command, &task.tenant_id);
        let dlq_key = keys::dlq(&task.command, &task.tenant_id);
        self.store.srem(&inprog_key, &task.id.to_string()).await?;
        self.store.sadd(&dlq_key, &task.id.to_string()).await?;
        self.store.del(&keys::lease(&task.id)).await?;

        task.status = TaskStatus::Failed;
        task.error = Some(reason.to_string());
        task.last_known_location = LastKnownLocation::Dlq;
        task.updated_at = self.now();
        self.persist_task(task).await
    }

    async fn route_to_delay(&self, task: &mut Task, delay_seconds: i64, now: i64) -> Result<()> {
        tracing::info!(task_id = %task.id, command = %task.command, delay_seconds, "task nacked, requeued with delay");
        let inprog_key = keys::inprog(&task.command, &task.tenant_id);
        let delayed_key = keys::delayed(&task.command, &task.tenant_id);
        self.store.srem(&inprog_key, &task.id.to_string()).await?;
        self.store.zadd(&delayed_key, &task.id.to_string(), (now + delay_seconds) as f64).await?;
        self.store.del(&keys::lease(&task.id)).await?;

        task.status = TaskStatus::Pending;
        task.worker_id = String::new();
        task.lease_until = 0;
        task.last_known_location = LastKnownLocation::Delayed;
        task.updated_at = now;
        self.persist_task(task).await
    }

    pub async fn heartbeat(&self, task_id: Uuid, worker_id: &str, extend_seconds: i64) -> Result<()> {
        let Some(mut task) = self.load_task(&task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };
        self.require_in_progress_owned(&task, worker_id)?;

        let lease_key = keys::lease(&task_id);
        if !self.store.exists(&lease_key).await? {
            return Err(Error::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        let now = self.now();
        self.store.setex(&lease_key, extend_seconds, worker_id).await?;
        task.lease_until = now + extend_seconds;
        task.updated_at = now;
        tracing::debug!(%task_id, %worker_id, extend_seconds, "lease extended via heartbeat");
        self.persist_task(&task).await
    }

    pub async fn abandon(&self, task_id: Uuid, worker_id: &str) -> Result<()> {
        let Some(mut task) = self.load_task(&task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };
        self.require_in_progress_owned(&task, worker_id)?;

        tracing::info!(%task_id, %worker_id, command = %task.command, "task abandoned, returned to pending");
        let inprog_key = keys::inprog(&task.command, &task.tenant_id);
        let pending_key = keys::pending(&task.command, &task.tenant_id, task.priority);
        self.store.srem(&inprog_key, &task.id.to_string()).await?;
        self.store.del(&keys::lease(&task.id)).await?;
        self.store.lpush(&pending_key, &task.id.to_string()).await?;

        let now = self.now();
        task.status = TaskStatus::Pending;
        task.worker_id = String::new();
        task.lease_until = 0;
        task.last_known_location = LastKnownLocation::Pending;
        task.updated_at = now;
        self.persist_task(&task).await
    }

    // -- Maintenance --------------------------------------------------------

    pub async fn move_due_delayed(&self, tenant_id: &str, command: &str, limit: usize) -> Result<i64> {
        let now = self.now();
        let delayed_key = keys::delayed(command, tenant_id);
        let due_ids = self.store.zrangebyscore(&delayed_key, f64::NEG_INFINITY, now as f64, limit).await?;
        if due_ids.is_empty() {
            return Ok(0);
        }

        let mut items = Vec::with_capacity(due_ids.len());
        let mut tasks = Vec::with_capacity(due_ids.len());
        for id_str in &due_ids {
            let Ok(task_id) = id_str.parse::<Uuid>() else { continue };
            let Some(task) = self.load_task(&task_id).await? else { continue };
            items.push(PromoteItem {
                task_id: id_str.clone(),
                pending_key: keys::pending(command, tenant_id, task.priority),
            });
            tasks.push(task);
        }

        let moved = self.store.eval_promote_batch(&delayed_key, &items).await?;
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            task.last_known_location = LastKnownLocation::Pending;
            task.updated_at = now;
            self.persist_task(&task).await?;
        }
        Ok(moved)
    }

    pub async fn cleanup_expired(&self, limit: usize, cutoff: i64) -> Result<i64> {
        let ids = self
            .store
            .zrangebyscore(keys::tasks_ttl(), f64::NEG_INFINITY, cutoff as f64, limit)
            .await?;
        let mut deleted = 0i64;

        for id_str in ids {
            if self.ghost_bloom.maybe_present(id_str.as_bytes()) {
                self.store.zrem(keys::tasks_ttl(), &id_str).await?;
                continue;
            }

            let Ok(task_id) = id_str.parse::<Uuid>() else {
                self.store.zrem(keys::tasks_ttl(), &id_str).await?;
                continue;
            };

            let Some(task) = self.load_task(&task_id).await? else {
                self.store.zrem(keys::tasks_ttl(), &id_str).await?;
                self.ghost_bloom.insert(id_str.as_bytes());
                continue;
            };

            self.store.hdel(keys::tasks(), &id_str).await?;
            self.store.hdel(keys::results(), &id_str).await?;
            self.store.del(&keys::lease(&task_id)).await?;
            if let Some(ref idem_key) = task.idempotency_key {
                self.store
                    .del(&keys::idempotency(&task.tenant_id, &task.command, idem_key))
                    .await?;
            }

            for priority in 0..=9u8 {
                self.store.srem(&keys::pending(&task.command, &task.tenant_id, priority), &id_str).await?;
            }
            self.store.zrem(&keys::delayed(&task.command, &task.tenant_id), &id_str).await?;
            self.store.srem(&keys::inprog(&task.command, &task.tenant_id), &id_str).await?;
            self.store.srem(&keys::dlq(&task.command, &task.tenant_id), &id_str).await?;

            self.store.zrem(keys::tasks_ttl(), &id_str).await?;
            self.ghost_bloom.insert(id_str.as_bytes());
            deleted += 1;
        }
        if deleted > 0 {
            tracing::debug!(deleted, "retention cleanup removed tasks past ttl");
        }
        Ok(deleted)
    }

    pub async fn queue_stats(&self, tenant_id: &str, command: &str) -> Result<QueueStats> {
        let mut pending = 0i64;
        for priority in 0..=9u8 {
            pending += self.store.llen(&keys::pending(command, tenant_id, priority)).await?;
        }
        Ok(QueueStats {
            pending,
            delayed: self.store.zcard(&keys::delayed(command, tenant_id)).await?,
            inprog: self.store.scard(&keys::inprog(command, tenant_id)).await?,
            dlq: self.store.scard(&keys::dlq(command, tenant_id)).await?,
        })
    }

    pub async fn pending_length(&self, tenant_id: &str, command: &str) -> Result<i64> {
        let mut total = 0i64;
        for priority in 0..=9u8 {
            total += self.store.llen(&keys::pending(command, tenant_id, priority)).await?;
        }
        Ok(total)
    }

    /// Best-effort snapshot across a caller-supplied set of commands (spec
    /// §4.4.1 "AdminQueues"). There is no queue registry in the data model
    /// (§3 lists only the per-command key families), so the admin surface
    /// must name the commands it wants stats for.
    pub async fn admin_queues(&self, tenant_id: &str, commands: &[String]) -> Result<Vec<(String, QueueStats)>> {
        let mut out = Vec::with_capacity(commands.len());
        for command in commands {
            out.push((command.clone(), self.queue_stats(tenant_id, command).await?));
        }
        Ok(out)
    }

    /// Convenience over [`Self::admin_queues`]: fans `QueueStats` across
    /// every command the tenant has ever enqueued, tracked in an additive
    /// `codeq:commands[:tenant]` set maintained by `enqueue`. Not a new
    /// operation in its own right, just a batched call to the existing one
    /// for admin tooling that doesn't want to track command names itself.
    pub async fn queue_stats_all(&self, tenant_id: &str) -> Result<Vec<(String, QueueStats)>> {
        const MAX_COMMANDS: usize = 10_000;
        let commands = self.store.smembers_sample(&keys::commands(tenant_id), MAX_COMMANDS).await?;
        self.admin_queues(tenant_id, &commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::MemoryStore;

    fn repo_with(config: EngineConfig, clock: Arc<TestClock>) -> TaskRepository {
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        TaskRepository::new(
            store,
            clock,
            Arc::new(SharedRng::seeded(42)),
            Arc::new(RotatingBloom::new(1_000, 0.01, 1_800, 0)),
            Arc::new(RotatingBloom::new(1_000, 0.01, 1_800, 0)),
            config,
        )
    }

    fn cmds(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn priority_respected() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        let low = repo.enqueue("", "x", "{}", 0, None, 0, None, 0).await.unwrap().task;
        let high = repo.enqueue("", "x", "{}", 9, None, 0, None, 0).await.unwrap().task;

        let first = repo.claim("", "w1", &cmds(&["x"]), 60).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let second = repo.claim("", "w1", &cmds(&["x"]), 60).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_same_task() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        let first = repo
            .enqueue("", "y", "{\"a\":1}", 0, None, 0, Some("k1".to_string()), 0)
            .await
            .unwrap()
            .task;
        let second = repo
            .enqueue("", "y", "{\"a\":1}", 0, None, 0, Some("k1".to_string()), 0)
            .await
            .unwrap()
            .task;
        assert_eq!(first.id, second.id);
        assert_eq!(repo.pending_length("", "y").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backoff_then_dlq() {
        let mut config = EngineConfig::default();
        config.backoff_policy = BackoffPolicy::Fixed;
        config.backoff_base_seconds = 1;
        config.backoff_max_seconds = 1;
        let clock = TestClock::new(0);
        let repo = repo_with(config, clock.clone());

        let task = repo.enqueue("", "z", "{}", 0, None, 3, None, 0).await.unwrap().task;

        let claimed = repo.claim("", "w1", &cmds(&["z"]), 60).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        let outcome = repo.nack(task.id, "w1", 0, 3, Some("boom".to_string())).await.unwrap();
        assert!(!outcome.moved_to_dlq);
        clock.advance(1);

        // Claim's own repair phase promotes the now-due delayed task before
        // the pop phase runs, so no separate `move_due_delayed` call is
        // needed here.
        let claimed = repo.claim("", "w1", &cmds(&["z"]), 60).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        let outcome = repo.nack(task.id, "w1", 0, 3, Some("boom".to_string())).await.unwrap();
        assert!(!outcome.moved_to_dlq);
        clock.advance(1);

        let claimed = repo.claim("", "w1", &cmds(&["z"]), 60).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 3);
        let outcome = repo.nack(task.id, "w1", 0, 3, Some("boom".to_string())).await.unwrap();
        assert!(outcome.moved_to_dlq);

        let stats = repo.queue_stats("", "z").await.unwrap();
        assert_eq!(stats.dlq, 1);
    }

    #[tokio::test]
    async fn lease_expiry_repair_requeues_with_backoff() {
        let mut config = EngineConfig::default();
        config.backoff_policy = BackoffPolicy::Fixed;
        config.backoff_base_seconds = 1;
        config.backoff_max_seconds = 5;
        let clock = TestClock::new(0);
        let repo = repo_with(config, clock.clone());

        let task = repo.enqueue("", "w", "{}", 0, None, 5, None, 0).await.unwrap().task;
        let claimed = repo.claim("", "w1", &cmds(&["w"]), 1).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        clock.advance(2);
        // Repair runs at the top of the next claim attempt; nothing is
        // claimable yet because the task landed back in `delayed`.
        assert!(repo.claim("", "w2", &cmds(&["w"]), 60).await.unwrap().is_none());

        clock.advance(1);
        let reclaimed = repo.claim("", "w2", &cmds(&["w"]), 60).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.attempts, 3); // claim(1) + repair(+1) + reclaim(+1)
    }

    #[tokio::test]
    async fn abandon_returns_same_task_and_does_not_itself_touch_attempts() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        let task = repo.enqueue("", "a", "{}", 5, None, 0, None, 0).await.unwrap().task;
        let claimed = repo.claim("", "w1", &cmds(&["a"]), 60).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);

        repo.abandon(task.id, "w1").await.unwrap();
        let after_abandon = repo.queue_stats("", "a").await.unwrap();
        assert_eq!(after_abandon.pending, 1);

        // Abandon itself never mutates `attempts`; the subsequent claim is
        // a normal successful claim and increments it like any other.
        let reclaimed = repo.claim("", "w2", &cmds(&["a"]), 60).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn nack_by_non_owner_is_rejected() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        let task = repo.enqueue("", "n", "{}", 0, None, 0, None, 0).await.unwrap().task;
        repo.claim("", "w1", &cmds(&["n"]), 60).await.unwrap();
        let err = repo.nack(task.id, "someone-else", 0, 5, None).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));
    }

    #[tokio::test]
    async fn tenant_isolation_keeps_claims_scoped() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        repo.enqueue("tenant-a", "t", "{}", 0, None, 0, None, 0).await.unwrap();
        repo.enqueue("tenant-a", "t", "{}", 0, None, 0, None, 0).await.unwrap();
        repo.enqueue("tenant-b", "t", "{}", 0, None, 0, None, 0).await.unwrap();

        let a1 = repo.claim("tenant-a", "w1", &cmds(&["t"]), 60).await.unwrap().unwrap();
        let a2 = repo.claim("tenant-a", "w1", &cmds(&["t"]), 60).await.unwrap().unwrap();
        assert_eq!(a1.tenant_id, "tenant-a");
        assert_eq!(a2.tenant_id, "tenant-a");
        assert!(repo.claim("tenant-a", "w1", &cmds(&["t"]), 60).await.unwrap().is_none());

        let b1 = repo.claim("tenant-b", "w1", &cmds(&["t"]), 60).await.unwrap().unwrap();
        assert_eq!(b1.tenant_id, "tenant-b");
    }

    #[tokio::test]
    async fn queue_stats_all_discovers_commands_without_a_caller_supplied_list() {
        let repo = repo_with(EngineConfig::default(), TestClock::new(0));
        repo.enqueue("tenant-a", "echo", "{}", 0, None, 0, None, 0).await.unwrap();
        repo.enqueue("tenant-a", "resize", "{}", 0, None, 0, None, 0).await.unwrap();
        repo.enqueue("tenant-b", "echo", "{}", 0, None, 0, None, 0).await.unwrap();

        let mut stats = repo.queue_stats_all("tenant-a").await.unwrap();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        let names: Vec<&str> = stats.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(names, vec!["echo", "resize"]);
        assert_eq!(stats[0].1.pending, 1);
    }
}
