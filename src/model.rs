//! The Task / ResultRecord / Subscription data model (spec §3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clamp a caller-supplied priority into the valid [0, 9] tier range.
pub fn clamp_priority(priority: i32) -> u8 {
    priority.clamp(0, 9) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optimization hint only — never authoritative. See spec §3 and §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastKnownLocation {
    Pending,
    Delayed,
    InProgress,
    Dlq,
}

impl LastKnownLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delayed => "delayed",
            Self::InProgress => "in_progress",
            Self::Dlq => "dlq",
        }
    }
}

/// Canonical task record, serialized under `tasks:<id>` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub tenant_id: String,
    pub command: String,
    pub payload: String,
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default)]
    pub worker_id: String,
    /// Advisory wall-clock; the `lease:<id>` TTL key is authoritative.
    pub lease_until: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result_key: Option<String>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub visible_at: i64,
    pub last_known_location: LastKnownLocation,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// `true` once `max_attempts` has been reached or exceeded.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.effective_max_attempts()
    }

    /// `max_attempts == 0` means "use the engine default"; callers resolve
    /// that default before persisting, so by the time a `Task` exists in
    /// the store this should already be positive. Kept defensive: treat a
    /// stray zero as "unbounded" is wrong per spec (positive required), so
    /// we fall back to 1 (single-attempt) rather than panic or loop.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }
}

/// Terminal result record, serialized under the `results` hash (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultRecord {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Opaque payload, base64-encoded by the caller. Decoded with padding
    /// fix-up on read (spec §4.5).
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
}

/// Base64 decode tolerant of inputs missing trailing `=` padding.
pub fn decode_base64_lenient(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    let padded = pad_base64(input);
    base64::engine::general_purpose::STANDARD.decode(padded.as_bytes())
}

/// `ResultRecord` with `payload` decoded from base64 (spec §4.5 `GetResult`).
/// This is what the scheduler façade hands back to callers; [`ResultRecord`]
/// itself stores the opaque base64 form, unchanged from what was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
    pub created_at: i64,
}

impl DecodedResult {
    pub fn from_record(record: ResultRecord) -> Result<Self, base64::DecodeError> {
        let payload = record.payload.as_deref().map(decode_base64_lenient).transpose()?;
        Ok(Self {
            task_id: record.task_id,
            status: record.status,
            payload,
            error: record.error,
            created_at: record.created_at,
        })
    }
}

fn pad_base64(input: &str) -> String {
    let rem = input.len() % 4;
    if rem == 0 {
        input.to_string()
    } else {
        let mut s = input.to_string();
        s.extend(std::iter::repeat('=').take(4 - rem));
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Fanout,
    Group,
    Hash,
}

/// Advisory webhook subscription metadata (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub delivery_mode: DeliveryMode,
    pub group_id: Option<String>,
    pub min_interval_seconds: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Subscription {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_clamps_to_valid_range() {
        assert_eq!(clamp_priority(10), 9);
        assert_eq!(clamp_priority(-1), 0);
        assert_eq!(clamp_priority(5), 5);
    }

    #[test]
    fn base64_padding_is_fixed_up() {
        // "hello" base64-encodes to "aGVsbG8=" — strip the padding and
        // confirm the lenient decoder still recovers it.
        let unpadded = "aGVsbG8";
        let decoded = decode_base64_lenient(unpadded).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn task_exhausted_respects_max_attempts() {
        let mut task = sample_task();
        task.max_attempts = 3;
        task.attempts = 2;
        assert!(!task.exhausted());
        task.attempts = 3;
        assert!(task.exhausted());
    }

    fn sample_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            tenant_id: String::new(),
            command: "x".into(),
            payload: "{}".into(),
            priority: 5,
            status: TaskStatus::Pending,
            worker_id: String::new(),
            lease_until: 0,
            attempts: 0,
            max_attempts: 3,
            error: None,
            result_key: None,
            webhook: None,
            idempotency_key: None,
            visible_at: 0,
            last_known_location: LastKnownLocation::Pending,
            created_at: 0,
            updated_at: 0,
        }
    }
}
