//! C7 — the scheduler façade: the engine's only public surface (spec
//! §4.7). Validates and defaults caller input, extracts tenant scope from
//! the caller identity, enforces scopes/allow-lists, orchestrates C4–C6,
//! and emits advisory events. Host code must go through here; the
//! repositories in [`crate::repository`] are not meant to be reached
//! directly.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bloom::RotatingBloom;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::identity::{CallerIdentity, Scope};
use crate::model::{clamp_priority, DecodedResult, DeliveryMode, ResultRecord, Subscription, Task, TaskStatus};
use crate::repository::task_repo::QueueStats;
use crate::repository::{ResultRepository, SubscriptionRepository, TaskRepository};
use crate::rng::SharedRng;
use crate::store::StoreOps;

fn check_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Canceled)
    } else {
        Ok(())
    }
}

fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(Error::validation("command", "must not be empty"));
    }
    Ok(())
}

/// http/https only — file://, data://, javascript: and friends are
/// rejected so a misconfigured webhook can't be used to reach internal
/// schemes the dispatcher wasn't meant to speak.
fn validate_webhook_url(url: Option<&str>) -> Result<()> {
    let Some(url) = url else { return Ok(()) };
    let parsed = url::Url::parse(url).map_err(|e| Error::validation("webhook", e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::validation("webhook", format!("unsupported scheme `{other}`"))),
    }
}

pub struct Scheduler {
    tasks: TaskRepository,
    results: ResultRepository,
    subs: SubscriptionRepository,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StoreOps>,
        clock: Arc<dyn Clock>,
        rng: Arc<SharedRng>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        let now = clock.now_unix();
        let idempotency_bloom = Arc::new(RotatingBloom::new(
            config.idempotency_bloom_capacity,
            config.idempotency_bloom_fp_rate,
            config.idempotency_bloom_rotate_seconds,
            now,
        ));
        let ghost_bloom = Arc::new(RotatingBloom::new(
            config.ghost_bloom_capacity,
            config.ghost_bloom_fp_rate,
            config.ghost_bloom_rotate_seconds,
            now,
        ));

        let tasks = TaskRepository::new(
            store.clone(),
            clock.clone(),
            rng,
            ghost_bloom,
            idempotency_bloom,
            config.clone(),
        );
        let results = ResultRepository::new(store.clone(), clock.clone(), config.retention_seconds);
        let subs = SubscriptionRepository::new(store, clock.clone());

        Self { tasks, results, subs, events, clock, config }
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
    }

    // -- Task operations -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, identity, cancel, payload), fields(tenant = %identity.tenant_id))]
    pub async fn create_task(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        command: &str,
        payload: &str,
        priority: i32,
        webhook: Option<String>,
        max_attempts: u32,
        idempotency_key: Option<String>,
        run_at: i64,
    ) -> Result<Task> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Enqueue)?;
        validate_command(command)?;
        identity.require_command_allowed(command)?;
        validate_webhook_url(webhook.as_deref())?;

        let priority = clamp_priority(priority);
        let tenant_id = identity.tenant_id.clone();
        let outcome = self
            .tasks
            .enqueue(&tenant_id, command, payload, priority, webhook, max_attempts, idempotency_key, run_at)
            .await?;

        if outcome.queue_became_available {
            let depth = self.tasks.pending_length(&tenant_id, command).await.unwrap_or(0) as u64;
            self.events
                .notify(Event::QueueAvailable { command: command.to_string(), approx_depth: depth })
                .await;
        }
        Ok(outcome.task)
    }

    pub async fn get_task(&self, identity: &CallerIdentity, cancel: &CancellationToken, task_id: Uuid) -> Result<Task> {
        check_canceled(cancel)?;
        let task = self.results.get_task(task_id).await?;
        identity.require_command_allowed(&task.command)?;
        Ok(task)
    }

    /// Polls `ClaimTask` until a task is available, the caller's
    /// `wait_millis` budget (capped at the configured ceiling) elapses, or
    /// `cancel` fires.
    #[tracing::instrument(skip(self, identity, cancel), fields(tenant = %identity.tenant_id))]
    pub async fn claim_task(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        worker_id: &str,
        commands: &[String],
        lease_seconds: i64,
        wait_millis: u64,
    ) -> Result<Option<Task>> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Claim)?;
        if commands.is_empty() {
            return Err(Error::validation("commands", "must be non-empty"));
        }
        for command in commands {
            identity.require_command_allowed(command)?;
        }

        let lease_seconds = if lease_seconds <= 0 { self.config.default_lease_seconds } else { lease_seconds };
        let wait_millis = self.config.clamp_wait_millis(wait_millis);
        let tenant_id = identity.tenant_id.clone();

        const POLL_INTERVAL_MS: u64 = 100;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(wait_millis);

        loop {
            check_canceled(cancel)?;
            if let Some(task) = self.tasks.claim(&tenant_id, worker_id, commands, lease_seconds).await? {
                return Ok(Some(task));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let step = remaining.min(std::time::Duration::from_millis(POLL_INTERVAL_MS));
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    #[tracing::instrument(skip(self, identity, cancel))]
    pub async fn heartbeat(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        task_id: Uuid,
        worker_id: &str,
        extend_seconds: i64,
    ) -> Result<()> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Heartbeat)?;
        let extend_seconds = if extend_seconds <= 0 { self.config.default_lease_seconds } else { extend_seconds };
        self.tasks.heartbeat(task_id, worker_id, extend_seconds).await
    }

    #[tracing::instrument(skip(self, identity, cancel))]
    pub async fn abandon(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<()> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Heartbeat)?;
        self.tasks.abandon(task_id, worker_id).await
    }

    #[tracing::instrument(skip(self, identity, cancel))]
    pub async fn nack(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        task_id: Uuid,
        worker_id: &str,
        override_delay_seconds: i64,
        reason: Option<String>,
    ) -> Result<Task> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Nack)?;
        let task = self.results.get_task(task_id).await?;
        self.tasks
            .nack(task_id, worker_id, override_delay_seconds, task.effective_max_attempts(), reason)
            .await?;
        self.results.get_task(task_id).await
    }

    #[tracing::instrument(skip(self, identity, cancel, payload))]
    pub async fn submit_result(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        task_id: Uuid,
        worker_id: &str,
        status: TaskStatus,
        payload: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Result)?;
        if !status.is_terminal() {
            return Err(Error::validation("status", "must be Completed or Failed"));
        }

        let task = self.results.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(Error::AlreadyTerminal { task_id, status: task.status.as_str() });
        }
        if task.status != TaskStatus::InProgress || task.worker_id != worker_id {
            return Err(Error::NotOwner { task_id, worker_id: worker_id.to_string() });
        }

        let record = ResultRecord { task_id, status, payload, error: error.clone(), created_at: self.now() };
        self.results.save_result(&record).await?;
        let finalized = self
            .results
            .finalize_task(task_id, &task.command, &task.tenant_id, status, error)
            .await?;

        self.events
            .notify(Event::TaskTerminal { task_id, status, webhook_url: finalized.webhook.clone() })
            .await;
        Ok(finalized)
    }

    #[tracing::instrument(skip(self, identity, cancel))]
    pub async fn get_result(&self, identity: &CallerIdentity, cancel: &CancellationToken, task_id: Uuid) -> Result<DecodedResult> {
        check_canceled(cancel)?;
        let task = self.results.get_task(task_id).await?;
        identity.require_command_allowed(&task.command)?;
        let record = self.results.get_result(task_id).await?;
        DecodedResult::from_record(record)
            .map_err(|err| Error::Internal(format!("corrupt base64 payload: {err}")))
    }

    pub async fn move_due_delayed(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        command: &str,
        limit: usize,
    ) -> Result<i64> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.tasks.move_due_delayed(&identity.tenant_id, command, limit).await
    }

    pub async fn cleanup_expired(&self, identity: &CallerIdentity, cancel: &CancellationToken, limit: usize) -> Result<i64> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.tasks.cleanup_expired(limit, self.now()).await
    }

    pub async fn admin_queues(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        commands: &[String],
    ) -> Result<Vec<(String, QueueStats)>> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.tasks.admin_queues(&identity.tenant_id, commands).await
    }

    pub async fn queue_stats(&self, identity: &CallerIdentity, cancel: &CancellationToken, command: &str) -> Result<QueueStats> {
        check_canceled(cancel)?;
        identity.require_command_allowed(command)?;
        self.tasks.queue_stats(&identity.tenant_id, command).await
    }

    pub async fn pending_length(&self, identity: &CallerIdentity, cancel: &CancellationToken, command: &str) -> Result<i64> {
        check_canceled(cancel)?;
        identity.require_command_allowed(command)?;
        self.tasks.pending_length(&identity.tenant_id, command).await
    }

    // -- Subscription operations ----------------------------------------------

    /// Resolves `deliveryMode`/`groupId` defaulting against the caller's
    /// `workerGroup` (spec §4.6): a token-carried `workerGroup` defaults
    /// both fields when the request omits `groupId`, and an explicit
    /// `groupId` must agree with it.
    fn resolve_delivery(
        identity: &CallerIdentity,
        delivery_mode: Option<DeliveryMode>,
        group_id: Option<String>,
    ) -> Result<(DeliveryMode, Option<String>)> {
        let (delivery_mode, group_id) = match &identity.worker_group {
            Some(worker_group) => {
                if let Some(ref requested) = group_id {
                    if requested != worker_group {
                        return Err(Error::validation(
                            "groupId",
                            "must match the caller's workerGroup when both are present",
                        ));
                    }
                }
                let resolved_group = group_id.unwrap_or_else(|| worker_group.clone());
                (delivery_mode.unwrap_or(DeliveryMode::Group), Some(resolved_group))
            }
            None => (delivery_mode.unwrap_or(DeliveryMode::Fanout), group_id),
        };

        if delivery_mode == DeliveryMode::Group && group_id.is_none() {
            return Err(Error::validation("groupId", "required for Group delivery mode"));
        }
        Ok((delivery_mode, group_id))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_subscription(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        callback_url: String,
        event_types: Vec<String>,
        delivery_mode: Option<DeliveryMode>,
        group_id: Option<String>,
        min_interval_seconds: u64,
        ttl_seconds: i64,
    ) -> Result<Subscription> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Subscribe)?;
        validate_webhook_url(Some(&callback_url))?;
        if event_types.is_empty() {
            return Err(Error::validation("eventTypes", "must be non-empty"));
        }
        for event_type in &event_types {
            identity.require_command_allowed(event_type)?;
        }
        let (delivery_mode, group_id) = Self::resolve_delivery(identity, delivery_mode, group_id)?;

        let sub = Subscription {
            id: String::new(),
            callback_url,
            event_types,
            delivery_mode,
            group_id,
            min_interval_seconds,
            created_at: 0,
            expires_at: 0,
        };
        self.subs.create(sub, ttl_seconds).await
    }

    pub async fn heartbeat_subscription(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        sub_id: &str,
        ttl_seconds: i64,
    ) -> Result<Subscription> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Subscribe)?;
        self.subs.heartbeat(sub_id, ttl_seconds).await
    }

    pub async fn list_active_subscriptions(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<Vec<Subscription>> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.subs.list_active(command).await
    }

    pub async fn allow_subscription_notify(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        sub_id: &str,
        min_interval_seconds: u64,
    ) -> Result<bool> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.subs.allow_notify(sub_id, min_interval_seconds).await
    }

    pub async fn next_subscription_group_index(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        command: &str,
        group_id: &str,
        modulo: u64,
    ) -> Result<u64> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.subs.next_group_index(command, group_id, modulo).await
    }

    pub async fn cleanup_subscriptions(
        &self,
        identity: &CallerIdentity,
        cancel: &CancellationToken,
        commands: &[String],
        limit: usize,
    ) -> Result<usize> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.subs.cleanup_expired(commands, limit, self.now()).await
    }

    /// Convenience over [`Self::admin_queues`]: fans `QueueStats` across
    /// every command the tenant has ever enqueued, with no registry to name
    /// up front (spec §9 has no queue registry in the data model).
    pub async fn queue_stats_all(&self, identity: &CallerIdentity, cancel: &CancellationToken) -> Result<Vec<(String, QueueStats)>> {
        check_canceled(cancel)?;
        identity.require_scope(Scope::Admin)?;
        self.tasks.queue_stats_all(&identity.tenant_id).await
    }

    /// Explicit shutdown hook: drains whatever is in flight on the event
    /// sink and consumes the repositories so their store handles drop,
    /// rather than relying on an implicit `Drop` a host can't `.await`.
    /// Matches §9's "construct on startup, shut down on drain; no
    /// process-wide singletons."
    pub async fn shutdown(self) {
        tracing::info!("scheduler shutting down");
        drop(self.tasks);
        drop(self.results);
        drop(self.subs);
        drop(self.events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::events::NullSink;
    use crate::store::memory::MemoryStore;

    fn worker(command: &str) -> CallerIdentity {
        CallerIdentity::unscoped("worker-1")
            .with_scopes([Scope::Enqueue, Scope::Claim, Scope::Heartbeat, Scope::Result, Scope::Nack, Scope::Subscribe, Scope::Admin])
            .with_allowed_event_types([command.to_string()])
    }

    fn scheduler(clock: Arc<TestClock>) -> Scheduler {
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        Scheduler::new(store, clock, Arc::new(SharedRng::seeded(1)), Arc::new(NullSink), EngineConfig::default())
    }

    #[tokio::test]
    async fn create_and_claim_and_submit_result_round_trip() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();

        let task = scheduler
            .create_task(&identity, &cancel, "echo", "{}", 5, None, 0, None, 0)
            .await
            .unwrap();

        let claimed = scheduler
            .claim_task(&identity, &cancel, "w1", &["echo".to_string()], 60, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);

        let finalized = scheduler
            .submit_result(&identity, &cancel, task.id, "w1", TaskStatus::Completed, Some("aGk=".into()), None)
            .await
            .unwrap();
        assert_eq!(finalized.status, TaskStatus::Completed);

        let result = scheduler.get_result(&identity, &cancel, task.id).await.unwrap();
        assert_eq!(result.payload.as_deref(), Some(b"hi".as_slice()));
    }

    #[tokio::test]
    async fn get_result_tolerates_missing_base64_padding() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();

        let task = scheduler
            .create_task(&identity, &cancel, "echo", "{}", 5, None, 0, None, 0)
            .await
            .unwrap();
        scheduler
            .claim_task(&identity, &cancel, "w1", &["echo".to_string()], 60, 0)
            .await
            .unwrap();

        // "aGVsbG8=" is "hello"; strip the trailing "=" to exercise the
        // lenient decode path.
        scheduler
            .submit_result(&identity, &cancel, task.id, "w1", TaskStatus::Completed, Some("aGVsbG8".into()), None)
            .await
            .unwrap();

        let result = scheduler.get_result(&identity, &cancel, task.id).await.unwrap();
        assert_eq!(result.payload.as_deref(), Some(b"hello".as_slice()));
    }

    #[tokio::test]
    async fn claim_with_zero_wait_returns_none_immediately_when_empty() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();
        let claimed = scheduler
            .claim_task(&identity, &cancel, "w1", &["echo".to_string()], 60, 0)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn disallowed_command_is_rejected() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();
        let err = scheduler
            .create_task(&identity, &cancel, "other", "{}", 0, None, 0, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn invalid_webhook_scheme_is_rejected() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();
        let err = scheduler
            .create_task(&identity, &cancel, "echo", "{}", 0, Some("ftp://evil".to_string()), 0, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn worker_group_defaults_subscription_to_group_mode() {
        let scheduler = scheduler(TestClock::new(0));
        let mut identity = worker("echo");
        identity.worker_group = Some("team-a".to_string());
        let cancel = CancellationToken::new();

        let sub = scheduler
            .create_subscription(&identity, &cancel, "https://example.com/hook".to_string(), vec!["echo".to_string()], None, None, 0, 0)
            .await
            .unwrap();
        assert_eq!(sub.delivery_mode, DeliveryMode::Group);
        assert_eq!(sub.group_id.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn mismatched_group_id_is_rejected() {
        let scheduler = scheduler(TestClock::new(0));
        let mut identity = worker("echo");
        identity.worker_group = Some("team-a".to_string());
        let cancel = CancellationToken::new();

        let err = scheduler
            .create_subscription(
                &identity,
                &cancel,
                "https://example.com/hook".to_string(),
                vec!["echo".to_string()],
                None,
                Some("team-b".to_string()),
                0,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn queue_stats_all_fans_out_over_discovered_commands() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();
        scheduler.create_task(&identity, &cancel, "echo", "{}", 0, None, 0, None, 0).await.unwrap();

        let stats = scheduler.queue_stats_all(&identity, &cancel).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "echo");
        assert_eq!(stats[0].1.pending, 1);
    }

    #[tokio::test]
    async fn shutdown_consumes_the_scheduler() {
        let scheduler = scheduler(TestClock::new(0));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn already_canceled_token_short_circuits() {
        let scheduler = scheduler(TestClock::new(0));
        let identity = worker("echo");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scheduler
            .create_task(&identity, &cancel, "echo", "{}", 0, None, 0, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
