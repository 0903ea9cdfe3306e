//! C2 — deterministic key derivation (spec §4.2).
//!
//! All keys are UTF-8, colon-delimited, prefixed `codeq:`. `command` is
//! lowercased. The tenant segment is inserted only when the tenant id is
//! non-empty, so the unscoped (legacy) and tenant-scoped key families are
//! structurally disjoint.

use sha2::{Digest, Sha256};

const PREFIX: &str = "codeq";

fn norm_command(command: &str) -> String {
    command.to_ascii_lowercase()
}

fn queue_base(command: &str, tenant_id: &str) -> String {
    let cmd = norm_command(command);
    if tenant_id.is_empty() {
        format!("{PREFIX}:q:{cmd}")
    } else {
        format!("{PREFIX}:q:{cmd}:{tenant_id}")
    }
}

pub fn pending(command: &str, tenant_id: &str, priority: u8) -> String {
    format!("{}:pending:{}", queue_base(command, tenant_id), priority)
}

pub fn delayed(command: &str, tenant_id: &str) -> String {
    format!("{}:delayed", queue_base(command, tenant_id))
}

pub fn inprog(command: &str, tenant_id: &str) -> String {
    format!("{}:inprog", queue_base(command, tenant_id))
}

pub fn dlq(command: &str, tenant_id: &str) -> String {
    format!("{}:dlq", queue_base(command, tenant_id))
}

pub fn tasks() -> &'static str {
    "codeq:tasks"
}

pub fn results() -> &'static str {
    "codeq:results"
}

pub fn tasks_ttl() -> &'static str {
    "codeq:tasks:ttl"
}

pub fn lease(task_id: &uuid::Uuid) -> String {
    format!("{PREFIX}:lease:{task_id}")
}

pub fn idempotency(tenant_id: &str, command: &str, idempotency_key: &str) -> String {
    let cmd = norm_command(command);
    let mut hasher = Sha256::new();
    hasher.update(idempotency_key.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("{PREFIX}:idempo:{tenant_id}:{cmd}:{hash}")
}

pub fn subs() -> &'static str {
    "codeq:subs"
}

pub fn subs_for_command(command: &str) -> String {
    format!("{PREFIX}:subs:{}", norm_command(command))
}

pub fn subs_last(sub_id: &str) -> String {
    format!("{PREFIX}:subs:last:{sub_id}")
}

pub fn subs_rr(command: &str, group_id: &str) -> String {
    format!("{PREFIX}:subs:rr:{}:{}", norm_command(command), group_id)
}

pub fn meta_version() -> &'static str {
    "codeq:meta:version"
}

/// Per-tenant set of commands ever enqueued under it. There is no queue
/// registry in the core data model (§3); this is an additive index used
/// only by `queue_stats_all` to avoid callers having to name every
/// command up front.
pub fn commands(tenant_id: &str) -> String {
    if tenant_id.is_empty() {
        format!("{PREFIX}:commands")
    } else {
        format!("{PREFIX}:commands:{tenant_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_and_scoped_families_are_disjoint() {
        let unscoped = pending("Echo", "", 9);
        let scoped = pending("Echo", "tenant-a", 9);
        assert_eq!(unscoped, "codeq:q:echo:pending:9");
        assert_eq!(scoped, "codeq:q:echo:tenant-a:pending:9");
        assert_ne!(unscoped, scoped);
    }

    #[test]
    fn command_is_lowercased() {
        assert_eq!(pending("ECHO", "", 0), pending("echo", "", 0));
    }

    #[test]
    fn idempotency_key_is_hashed_not_embedded_verbatim() {
        let key = idempotency("t1", "cmd", "secret-business-id");
        assert!(!key.contains("secret-business-id"));
        assert!(key.starts_with("codeq:idempo:t1:cmd:"));
    }

    #[test]
    fn lease_key_round_trips_task_id() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(lease(&id), format!("codeq:lease:{id}"));
    }
}
