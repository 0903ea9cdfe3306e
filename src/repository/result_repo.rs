//! C5 — the result repository: persist terminal results and finalize the
//! owning task (spec §4.5).

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{LastKnownLocation, ResultRecord, Task, TaskStatus};
use crate::store::StoreOps;

pub struct ResultRepository {
    store: Arc<dyn StoreOps>,
    clock: Arc<dyn Clock>,
    retention_seconds: i64,
}

impl ResultRepository {
    pub fn new(store: Arc<dyn StoreOps>, clock: Arc<dyn Clock>, retention_seconds: i64) -> Self {
        Self { store, clock, retention_seconds }
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
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

    /// HSET result into `results`. Ownership/terminal-state checks happen
    /// upstream in [`Self::finalize_task`]; this method is safe to call on
    /// its own since it never touches queue membership.
    pub async fn save_result(&self, record: &ResultRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| Error::Internal(format!("failed to serialize result {}: {e}", record.task_id)))?;
        self.store.hset(keys::results(), &record.task_id.to_string(), &json).await
    }

    /// `UpdateTaskOnComplete` + `RemoveFromInprogAndClearLease` bundled into
    /// one round trip via the committed terminal-dispatch script (spec §4.5,
    /// §6 script 3): `SREM inprog`, `DEL lease`, `HSET tasks` all atomic.
    /// Ownership is checked by the caller (the scheduler façade) before this
    /// is invoked — this method only finalizes an already-verified
    /// transition.
    pub async fn finalize_task(
        &self,
        task_id: Uuid,
        command: &str,
        tenant_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task> {
        let Some(mut task) = self.load_task(&task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };

        let now = self.now();
        task.status = status;
        task.worker_id = String::new();
        task.lease_until = 0;
        task.error = error;
        task.result_key = Some(keys::results().to_string());
        task.updated_at = now;
        task.last_known_location = match status {
            TaskStatus::Completed => LastKnownLocation::Pending, // tombstoned by TTL, no real queue membership
            _ => LastKnownLocation::Dlq,
        };

        let json = serde_json::to_string(&task)
            .map_err(|e| Error::Internal(format!("failed to serialize task {task_id}: {e}")))?;
        self.store
            .eval_terminal_dispatch(
                &keys::inprog(command, tenant_id),
                &keys::lease(&task_id),
                keys::tasks(),
                &task_id.to_string(),
                &json,
            )
            .await?;

        self.store
            .zadd(keys::tasks_ttl(), &task_id.to_string(), (now + self.retention_seconds) as f64)
            .await?;

        tracing::info!(%task_id, %command, status = task.status.as_str(), "task reached terminal state");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.load_task(&task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id.to_string()))
    }

    pub async fn get_result(&self, task_id: Uuid) -> Result<ResultRecord> {
        let raw = self.store.hget(keys::results(), &task_id.to_string()).await?;
        match raw {
            None => Err(Error::not_found("result", task_id.to_string())),
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                tracing::error!(%task_id, error = %e, "corrupt result record");
                Error::Internal(format!("corrupt result record {task_id}: {e}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::model::TaskStatus;
    use crate::store::memory::MemoryStore;

    fn sample_task(id: Uuid) -> Task {
        Task {
            id,
            tenant_id: String::new(),
            command: "echo".into(),
            payload: "{}".into(),
            priority: 0,
            status: TaskStatus::InProgress,
            worker_id: "w1".into(),
            lease_until: 100,
            attempts: 1,
            max_attempts: 5,
            error: None,
            result_key: None,
            webhook: None,
            idempotency_key: None,
            visible_at: 0,
            last_known_location: LastKnownLocation::InProgress,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn save_result_then_get_result_round_trips() {
        let clock = TestClock::new(0);
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        let repo = ResultRepository::new(store.clone(), clock, 3600);

        let id = Uuid::new_v4();
        let json = serde_json::to_string(&sample_task(id)).unwrap();
        store.hset(keys::tasks(), &id.to_string(), &json).await.unwrap();

        let record = ResultRecord {
            task_id: id,
            status: TaskStatus::Completed,
            payload: Some("aGVsbG8=".to_string()),
            error: None,
            created_at: 0,
        };
        repo.save_result(&record).await.unwrap();
        let fetched = repo.get_result(id).await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn finalize_task_clears_ownership_and_inprog_membership() {
        let clock = TestClock::new(0);
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        let repo = ResultRepository::new(store.clone(), clock, 3600);

        let id = Uuid::new_v4();
        let json = serde_json::to_string(&sample_task(id)).unwrap();
        store.hset(keys::tasks(), &id.to_string(), &json).await.unwrap();
        store.sadd(&keys::inprog("echo", ""), &id.to_string()).await.unwrap();

        let task = repo
            .finalize_task(id, "echo", "", TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.worker_id, "");
        assert_eq!(task.lease_until, 0);
        assert_eq!(task.result_key.as_deref(), Some(keys::results()));

        assert_eq!(store.scard(&keys::inprog("echo", "")).await.unwrap(), 0);

        let reloaded = repo.get_task(id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn finalize_task_with_error_routes_to_failed_location() {
        let clock = TestClock::new(0);
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        let repo = ResultRepository::new(store.clone(), clock, 3600);

        let id = Uuid::new_v4();
        let json = serde_json::to_string(&sample_task(id)).unwrap();
        store.hset(keys::tasks(), &id.to_string(), &json).await.unwrap();

        let task = repo
            .finalize_task(id, "echo", "", TaskStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.last_known_location, LastKnownLocation::Dlq);
    }

    #[tokio::test]
    async fn get_result_for_missing_task_is_not_found() {
        let clock = TestClock::new(0);
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        let repo = ResultRepository::new(store, clock, 3600);
        let err = repo.get_result(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn finalize_task_for_missing_task_is_not_found() {
        let clock = TestClock::new(0);
        let store: Arc<dyn StoreOps> = Arc::new(MemoryStore::new(clock.clone()));
        let repo = ResultRepository::new(store, clock, 3600);
        let err = repo
            .finalize_task(Uuid::new_v4(), "echo", "", TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
