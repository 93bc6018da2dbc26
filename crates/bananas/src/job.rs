//! Job record and related types.

use crate::error::{BananasError, BananasResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Routing key assigned when the client leaves it empty.
pub const DEFAULT_ROUTING_KEY: &str = "default";

/// Maximum routing key length.
pub const MAX_ROUTING_KEY_LEN: usize = 64;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a ready queue.
    Pending,
    /// Waiting in the delayed set for its fire time.
    Scheduled,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully; record carries a TTL.
    Completed,
    /// Exhausted retries; record carries a TTL and the id sits in the DLQ.
    Failed,
}

impl JobStatus {
    /// Canonical lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution priority, a preference over ordering within a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities, highest first. The dequeue scan order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Canonical lowercase name, as used in queue keys and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = BananasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(BananasError::Configuration(format!(
                "unknown priority {:?}",
                other
            ))),
        }
    }
}

/// Validates a routing key: 1..=64 characters from `[A-Za-z0-9_-]`.
pub fn validate_routing_key(key: &str) -> BananasResult<()> {
    if key.is_empty()
        || key.len() > MAX_ROUTING_KEY_LEN
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BananasError::InvalidRoutingKey(key.to_string()));
    }
    Ok(())
}

mod payload_bytes {
    //! Serializes payload bytes as base64 inside JSON records.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A unit of asynchronous work.
///
/// The record at `job:{id}` is the single source of truth for a job; queue
/// lists and the delayed set only carry ids. The worker that claims a job
/// owns mutation of `status`, `attempts`, `error`, and `updated_at` for the
/// duration of the processing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Handler-registry key.
    pub name: String,

    /// Optional free text. The cron scheduler uses this for attribution.
    #[serde(default)]
    pub description: String,

    /// Framed payload bytes (see [`crate::codec`]).
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Execution priority.
    pub priority: Priority,

    /// Routing key restricting which workers may consume the job.
    pub routing_key: String,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,

    /// Fire time; present only while scheduled or awaiting retry.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Failed execution count.
    pub attempts: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Last error message; empty unless the last attempt failed.
    #[serde(default)]
    pub error: String,
}

impl Job {
    /// Creates a job with a fresh id and defaults.
    ///
    /// `payload` is expected to be framed by [`crate::codec`].
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            description: String::new(),
            payload,
            status: JobStatus::Pending,
            priority: Priority::Normal,
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: String::new(),
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the routing key. Validated at enqueue time.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks the job for delayed execution at `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Scheduled;
        self.scheduled_for = Some(at);
        self
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Retry delay after the given failed-attempt count, in seconds.
    ///
    /// Doubling per attempt, so strictly monotonic: 2s, 4s, 8s, ...
    pub fn backoff_seconds(attempts: u32) -> u64 {
        1u64 << attempts.min(62)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> BananasResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the JSON wire form.
    pub fn from_json(json: &str) -> BananasResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use serde_json::json;

    #[test]
    fn job_id_generation() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn routing_key_validation() {
        assert!(validate_routing_key("default").is_ok());
        assert!(validate_routing_key("gpu-pool_2").is_ok());
        assert!(validate_routing_key(&"a".repeat(64)).is_ok());

        assert!(validate_routing_key("").is_err());
        assert!(validate_routing_key(&"a".repeat(65)).is_err());
        assert!(validate_routing_key("no spaces").is_err());
        assert!(validate_routing_key("é").is_err());
    }

    #[test]
    fn backoff_is_monotonic() {
        assert_eq!(Job::backoff_seconds(1), 2);
        assert_eq!(Job::backoff_seconds(2), 4);
        assert_eq!(Job::backoff_seconds(3), 8);
        for attempts in 1..20 {
            assert!(Job::backoff_seconds(attempts + 1) > Job::backoff_seconds(attempts));
        }
    }

    #[test]
    fn wire_round_trip() {
        let payload = codec::encode_json(&json!({"x": 1})).unwrap();
        let job = Job::new("echo", payload.clone())
            .with_priority(Priority::High)
            .with_routing_key("gpu");

        let json = job.to_json().unwrap();
        let restored = Job::from_json(&json).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.name, "echo");
        assert_eq!(restored.priority, Priority::High);
        assert_eq!(restored.routing_key, "gpu");
        assert_eq!(restored.payload, payload);
        assert_eq!(restored.status, JobStatus::Pending);
    }

    #[test]
    fn wire_field_names() {
        let job = Job::new("echo", codec::encode_json(&json!({})).unwrap());
        let value: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        for field in [
            "id",
            "name",
            "description",
            "payload",
            "status",
            "priority",
            "routing_key",
            "created_at",
            "updated_at",
            "scheduled_for",
            "attempts",
            "max_retries",
            "error",
        ] {
            assert!(object.contains_key(field), "missing field {}", field);
        }

        assert_eq!(object["status"], "pending");
        assert_eq!(object["priority"], "normal");
        // Timestamps are UTC with a Z suffix.
        assert!(object["created_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn scheduled_builder_sets_status() {
        let at = Utc::now() + chrono::Duration::seconds(60);
        let job = Job::new("later", Vec::new()).scheduled_at(at);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_for, Some(at));
    }
}
