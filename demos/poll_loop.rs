//! A minimal worker loop against a live codeq engine: claim, "process",
//! submit result, repeat. Mirrors the teacher worker's env-var
//! configuration style, adapted to the async engine API.
//!
//! ENV:
//! - CODEQ_STORE_ADDR (default redis://127.0.0.1:6379)
//! - CODEQ_WORKER_COMMANDS comma-separated list of commands to claim (default "echo")
//! - CODEQ_WORKER_ID (default "poll-loop-worker")

use std::sync::Arc;
use std::time::Duration;

use codeq::clock::SystemClock;
use codeq::events::NullSink;
use codeq::identity::{CallerIdentity, Scope};
use codeq::model::TaskStatus;
use codeq::rng::SharedRng;
use codeq::store::redis_store::RedisStore;
use codeq::{EngineConfig, Scheduler};
use tokio_util::sync::CancellationToken;

const CONNECT_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env();
    let commands: Vec<String> = std::env::var("CODEQ_WORKER_COMMANDS")
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    let worker_id = std::env::var("CODEQ_WORKER_ID").unwrap_or_else(|_| "poll-loop-worker".to_string());

    tracing::info!(?commands, %worker_id, "starting poll loop");

    let store = Arc::new(RedisStore::connect(&config.store_addr, CONNECT_ATTEMPTS).await?);
    let scheduler = Scheduler::new(
        store,
        Arc::new(SystemClock),
        Arc::new(SharedRng::from_entropy()),
        Arc::new(NullSink),
        config,
    );

    let identity = CallerIdentity::unscoped(worker_id.as_str())
        .with_scopes([Scope::Claim, Scope::Heartbeat, Scope::Result])
        .with_allowed_event_types(commands.clone());
    let cancel = CancellationToken::new();

    loop {
        match scheduler.claim_task(&identity, &cancel, &worker_id, &commands, 30, 5_000).await {
            Ok(Some(task)) => {
                tracing::info!(task_id = %task.id, command = %task.command, "claimed task");
                let outcome = scheduler
                    .submit_result(&identity, &cancel, task.id, &worker_id, TaskStatus::Completed, None, None)
                    .await;
                if let Err(err) = outcome {
                    tracing::warn!(task_id = %task.id, %err, "failed to submit result");
                }
            }
            Ok(None) => {
                tracing::debug!("no task available, polling again");
            }
            Err(err) => {
                tracing::error!(%err, "claim failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
