//! Store key layout.
//!
//! All keys live under a shared namespace prefix (`bananas` by default) so
//! that cross-language clients agree on the layout bit-for-bit.

use crate::job::Priority;

/// Default namespace prefix applied to every key.
pub const DEFAULT_PREFIX: &str = "bananas";

/// Key builder for the queue layout.
///
/// Shared keys are precomputed at construction; hot-path per-id keys are
/// cheap `format!` calls. Worker source lists are precomputed once via
/// [`Keys::ready_sources`].
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
    processing: String,
    dead: String,
    scheduled: String,
}

impl Keys {
    /// Create a key builder with the given namespace prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            processing: format!("{}:queue:processing", prefix),
            dead: format!("{}:queue:dead", prefix),
            scheduled: format!("{}:queue:scheduled", prefix),
            prefix,
        }
    }

    /// Job record key (string).
    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Ready-queue list key for a (routing key, priority) pair.
    pub fn ready(&self, routing_key: &str, priority: Priority) -> String {
        format!(
            "{}:route:{}:queue:{}",
            self.prefix,
            routing_key,
            priority.as_str()
        )
    }

    /// Shared processing list key.
    pub fn processing(&self) -> &str {
        &self.processing
    }

    /// Shared dead-letter list key.
    pub fn dead(&self) -> &str {
        &self.dead
    }

    /// Shared delayed sorted-set key (score = fire time, seconds since epoch).
    pub fn scheduled(&self) -> &str {
        &self.scheduled
    }

    /// Result record key (hash).
    pub fn result(&self, job_id: &str) -> String {
        format!("{}:result:{}", self.prefix, job_id)
    }

    /// Result notification channel for a job.
    pub fn result_channel(&self, job_id: &str) -> String {
        format!("{}:result:notify:{}", self.prefix, job_id)
    }

    /// Persistent schedule state key (hash).
    pub fn schedule_state(&self, schedule_id: &str) -> String {
        format!("{}:schedules:{}", self.prefix, schedule_id)
    }

    /// Distributed per-schedule lock key (string holding the owner token).
    pub fn schedule_lock(&self, schedule_id: &str) -> String {
        format!("{}:schedule_lock:{}", self.prefix, schedule_id)
    }

    /// Ordered dequeue source list: the cross-product of routing keys
    /// (outer) and priorities (inner).
    ///
    /// The order is what gives dequeue its preference semantics: the first
    /// routing key's queues are fully scanned, highest priority first,
    /// before the second routing key is consulted.
    pub fn ready_sources(&self, routing_keys: &[String], priorities: &[Priority]) -> Vec<String> {
        let mut sources = Vec::with_capacity(routing_keys.len() * priorities.len());
        for rk in routing_keys {
            for &priority in priorities {
                sources.push(self.ready(rk, priority));
            }
        }
        sources
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
