//! Engine configuration (spec §6 "Configuration").

use serde::Deserialize;

use crate::backoff::BackoffPolicy;

#[derive(Clone, Deserialize)]
pub struct EngineConfig {
    pub store_addr: String,
    #[serde(default)]
    pub store_password: Option<String>,

    #[serde(default = "default_lease_seconds")]
    pub default_lease_seconds: i64,
    #[serde(default = "default_requeue_inspect_limit")]
    pub requeue_inspect_limit: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_default: u32,

    #[serde(default = "default_backoff_policy")]
    pub backoff_policy: BackoffPolicy,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: i64,
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: i64,

    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: i64,

    #[serde(default = "default_bloom_capacity")]
    pub idempotency_bloom_capacity: usize,
    #[serde(default = "default_bloom_fp_rate")]
    pub idempotency_bloom_fp_rate: f64,
    #[serde(default = "default_bloom_rotate_seconds")]
    pub idempotency_bloom_rotate_seconds: i64,

    #[serde(default = "default_bloom_capacity")]
    pub ghost_bloom_capacity: usize,
    #[serde(default = "default_bloom_fp_rate")]
    pub ghost_bloom_fp_rate: f64,
    #[serde(default = "default_bloom_rotate_seconds")]
    pub ghost_bloom_rotate_seconds: i64,

    #[serde(default = "default_subscription_min_interval_seconds")]
    pub subscription_min_interval_seconds: u64,
    #[serde(default = "default_subscription_cleanup_interval_seconds")]
    pub subscription_cleanup_interval_seconds: u64,

    #[serde(default = "default_wait_millis_cap")]
    pub wait_millis_cap: u64,
}

fn default_lease_seconds() -> i64 {
    30
}
fn default_requeue_inspect_limit() -> usize {
    200
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_policy() -> BackoffPolicy {
    BackoffPolicy::ExpEqualJitter
}
fn default_backoff_base_seconds() -> i64 {
    1
}
fn default_backoff_max_seconds() -> i64 {
    300
}
fn default_retention_seconds() -> i64 {
    24 * 60 * 60
}
fn default_bloom_capacity() -> usize {
    1_000_000
}
fn default_bloom_fp_rate() -> f64 {
    0.01
}
fn default_bloom_rotate_seconds() -> i64 {
    30 * 60
}
fn default_subscription_min_interval_seconds() -> u64 {
    5
}
fn default_subscription_cleanup_interval_seconds() -> u64 {
    300
}
fn default_wait_millis_cap() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_addr: "redis://127.0.0.1:6379".to_string(),
            store_password: None,
            default_lease_seconds: default_lease_seconds(),
            requeue_inspect_limit: default_requeue_inspect_limit(),
            max_attempts_default: default_max_attempts(),
            backoff_policy: default_backoff_policy(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            retention_seconds: default_retention_seconds(),
            idempotency_bloom_capacity: default_bloom_capacity(),
            idempotency_bloom_fp_rate: default_bloom_fp_rate(),
            idempotency_bloom_rotate_seconds: default_bloom_rotate_seconds(),
            ghost_bloom_capacity: default_bloom_capacity(),
            ghost_bloom_fp_rate: default_bloom_fp_rate(),
            ghost_bloom_rotate_seconds: default_bloom_rotate_seconds(),
            subscription_min_interval_seconds: default_subscription_min_interval_seconds(),
            subscription_cleanup_interval_seconds: default_subscription_cleanup_interval_seconds(),
            wait_millis_cap: default_wait_millis_cap(),
        }
    }
}

impl EngineConfig {
    /// Manual `std::env::var(..).unwrap_or_else(...)` loading in the
    /// teacher worker's idiom, kept for the `demos/` binary and
    /// integration tests that want real-environment overrides without a
    /// config file.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_addr: std::env::var("CODEQ_STORE_ADDR").unwrap_or(defaults.store_addr),
            store_password: std::env::var("CODEQ_STORE_PASSWORD").ok(),
            default_lease_seconds: env_parsed("CODEQ_DEFAULT_LEASE_SECONDS")
                .unwrap_or(defaults.default_lease_seconds),
            requeue_inspect_limit: env_parsed("CODEQ_REQUEUE_INSPECT_LIMIT")
                .unwrap_or(defaults.requeue_inspect_limit),
            max_attempts_default: env_parsed("CODEQ_MAX_ATTEMPTS_DEFAULT")
                .unwrap_or(defaults.max_attempts_default),
            backoff_base_seconds: env_parsed("CODEQ_BACKOFF_BASE_SECONDS")
                .unwrap_or(defaults.backoff_base_seconds),
            backoff_max_seconds: env_parsed("CODEQ_BACKOFF_MAX_SECONDS")
                .unwrap_or(defaults.backoff_max_seconds),
            retention_seconds: env_parsed("CODEQ_RETENTION_SECONDS")
                .unwrap_or(defaults.retention_seconds),
            wait_millis_cap: env_parsed("CODEQ_WAIT_MILLIS_CAP").unwrap_or(defaults.wait_millis_cap),
            ..defaults
        }
    }

    pub fn clamp_wait_millis(&self, wait_millis: u64) -> u64 {
        wait_millis.min(self.wait_millis_cap)
    }

    pub fn resolve_max_attempts(&self, caller_supplied: u32) -> u32 {
        if caller_supplied == 0 {
            self.max_attempts_default
        } else {
            caller_supplied
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("store_addr", &self.store_addr)
            .field("store_password", &self.store_password.as_ref().map(|_| "<redacted>"))
            .field("default_lease_seconds", &self.default_lease_seconds)
            .field("requeue_inspect_limit", &self.requeue_inspect_limit)
            .field("max_attempts_default", &self.max_attempts_default)
            .field("backoff_policy", &self.backoff_policy)
            .field("backoff_base_seconds", &self.backoff_base_seconds)
            .field("backoff_max_seconds", &self.backoff_max_seconds)
            .field("retention_seconds", &self.retention_seconds)
            .field("wait_millis_cap", &self.wait_millis_cap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_millis_clamps_to_cap() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.clamp_wait_millis(30_001), 30_000);
        assert_eq!(cfg.clamp_wait_millis(10), 10);
    }

    #[test]
    fn zero_max_attempts_resolves_to_engine_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.resolve_max_attempts(0), cfg.max_attempts_default);
        assert_eq!(cfg.resolve_max_attempts(7), 7);
    }

    #[test]
    fn debug_output_redacts_store_password() {
        let mut cfg = EngineConfig::default();
        cfg.store_password = Some("hunter2".to_string());
        let text = format!("{cfg:?}");
        assert!(!text.contains("hunter2"));
    }
}
