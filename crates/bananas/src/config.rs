//! Configuration for the task queue system.

use crate::error::{BananasError, BananasResult};
use crate::job::{validate_routing_key, Priority};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BananasConfig {
    /// Store connection configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Queue engine configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Result backend configuration.
    #[serde(default)]
    pub result: ResultConfig,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl BananasConfig {
    /// Validates the configuration; errors here are fatal at bootstrap.
    pub fn validate(&self) -> BananasResult<()> {
        if self.store.url.is_empty() {
            return Err(BananasError::Configuration(
                "store.url must be set".to_string(),
            ));
        }

        if self.worker.mode != WorkerMode::SchedulerOnly {
            if self.worker.concurrency == 0 {
                return Err(BananasError::Configuration(
                    "worker.concurrency must be at least 1".to_string(),
                ));
            }
            if self.worker.priorities.is_empty() {
                return Err(BananasError::Configuration(
                    "worker.priorities must not be empty".to_string(),
                ));
            }
            if self.worker.routing_keys.is_empty() {
                return Err(BananasError::Configuration(
                    "worker.routing_keys must not be empty".to_string(),
                ));
            }
            for rk in &self.worker.routing_keys {
                validate_routing_key(rk)?;
            }
        }

        if self.worker.mode == WorkerMode::JobSpecialized
            && self.worker.job_types.as_ref().map_or(true, Vec::is_empty)
        {
            return Err(BananasError::Configuration(
                "worker.job_types is required in job-specialized mode".to_string(),
            ));
        }

        // The store read timeout must outlast a blocking pop.
        if self.store.read_timeout_secs <= self.worker.block_timeout_secs {
            return Err(BananasError::Configuration(format!(
                "store.read_timeout_secs ({}) must exceed worker.block_timeout_secs ({})",
                self.store.read_timeout_secs, self.worker.block_timeout_secs
            )));
        }

        Ok(())
    }
}

/// Store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://localhost:6379`.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection pool size. Must cover one connection per worker for the
    /// duration of a blocking pop, plus headroom for other operations.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Read timeout in seconds; must exceed the blocking-pop timeout.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Namespace prefix for all keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Initial reconnect backoff after a store error, in seconds.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,

    /// Reconnect backoff cap, in seconds.
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            pool_size: default_pool_size(),
            read_timeout_secs: default_read_timeout(),
            key_prefix: default_key_prefix(),
            reconnect_base_secs: default_reconnect_base(),
            reconnect_cap_secs: default_reconnect_cap(),
        }
    }
}

fn default_store_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_read_timeout() -> u64 {
    30
}

fn default_key_prefix() -> String {
    crate::keys::DEFAULT_PREFIX.to_string()
}

fn default_reconnect_base() -> u64 {
    2
}

fn default_reconnect_cap() -> u64 {
    30
}

/// Deployment shape of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Workers plus the scheduler loops in one process.
    Thin,
    /// Workers only; an external process runs the scheduler loops.
    Default,
    /// Workers restricted to a subset of priorities.
    Specialized,
    /// Workers restricted to an allow-list of job names.
    JobSpecialized,
    /// No workers; only the promotion and cron loops run.
    SchedulerOnly,
}

impl Default for WorkerMode {
    fn default() -> Self {
        WorkerMode::Default
    }
}

impl WorkerMode {
    /// Whether this process runs the worker pool.
    pub fn pool_enabled(&self) -> bool {
        *self != WorkerMode::SchedulerOnly
    }

    /// Whether this process runs the promotion and cron loops.
    pub fn scheduler_in_process(&self) -> bool {
        matches!(self, WorkerMode::Thin | WorkerMode::SchedulerOnly)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Deployment shape.
    #[serde(default)]
    pub mode: WorkerMode,

    /// Number of concurrent worker tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Ordered priority scan list.
    #[serde(default = "default_priorities")]
    pub priorities: Vec<Priority>,

    /// Ordered routing-key scan list.
    #[serde(default = "default_routing_keys")]
    pub routing_keys: Vec<String>,

    /// Allow-list of job names for job-specialized mode.
    #[serde(default)]
    pub job_types: Option<Vec<String>>,

    /// Blocking-pop timeout in seconds.
    #[serde(default = "default_block_timeout")]
    pub block_timeout_secs: u64,

    /// Shutdown grace period in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Per-job execution deadline in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Default retry budget for submitted jobs.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::default(),
            concurrency: default_concurrency(),
            priorities: default_priorities(),
            routing_keys: default_routing_keys(),
            job_types: None,
            block_timeout_secs: default_block_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            job_timeout_secs: default_job_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl WorkerConfig {
    /// Blocking-pop timeout as a Duration.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs)
    }

    /// Shutdown grace as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Per-job deadline as a Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_priorities() -> Vec<Priority> {
    Priority::ALL.to_vec()
}

fn default_routing_keys() -> Vec<String> {
    vec![crate::job::DEFAULT_ROUTING_KEY.to_string()]
}

fn default_block_timeout() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_job_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

/// Queue engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// TTL applied to job records on completion, in seconds.
    #[serde(default = "default_completed_ttl")]
    pub completed_ttl_secs: u64,

    /// TTL applied to job records on terminal failure, in seconds.
    #[serde(default = "default_failed_ttl")]
    pub failed_ttl_secs: u64,

    /// Reaper threshold: jobs stuck in `processing` longer than this are
    /// requeued. Off unless explicitly set; the right value depends on the
    /// deployment's longest legitimate job.
    #[serde(default)]
    pub reap_after_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            completed_ttl_secs: default_completed_ttl(),
            failed_ttl_secs: default_failed_ttl(),
            reap_after_secs: None,
        }
    }
}

fn default_completed_ttl() -> u64 {
    86400 // 24 hours
}

fn default_failed_ttl() -> u64 {
    86400 * 7
}

/// Result backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultConfig {
    /// Whether results are stored at all.
    #[serde(default = "default_result_enabled")]
    pub enabled: bool,

    /// TTL for success records, in seconds.
    #[serde(default = "default_success_ttl")]
    pub success_ttl_secs: u64,

    /// TTL for failure records, in seconds.
    #[serde(default = "default_failure_ttl")]
    pub failure_ttl_secs: u64,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            enabled: default_result_enabled(),
            success_ttl_secs: default_success_ttl(),
            failure_ttl_secs: default_failure_ttl(),
        }
    }
}

fn default_result_enabled() -> bool {
    true
}

fn default_success_ttl() -> u64 {
    3600 // 1 hour
}

fn default_failure_ttl() -> u64 {
    86400 // 24 hours
}

/// Scheduler configuration (promotion loop and cron scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Promotion-loop tick interval in milliseconds.
    #[serde(default = "default_promotion_interval")]
    pub promotion_interval_ms: u64,

    /// Whether the cron scheduler runs.
    #[serde(default = "default_cron_enabled")]
    pub cron_enabled: bool,

    /// Cron tick interval in milliseconds.
    #[serde(default = "default_cron_interval")]
    pub cron_interval_ms: u64,

    /// Per-schedule lock TTL in seconds. Must exceed the worst-case time
    /// from deciding to fire through the enqueue committing.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            promotion_interval_ms: default_promotion_interval(),
            cron_enabled: default_cron_enabled(),
            cron_interval_ms: default_cron_interval(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl SchedulerConfig {
    /// Promotion tick interval as a Duration.
    pub fn promotion_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_interval_ms)
    }

    /// Cron tick interval as a Duration.
    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval_ms)
    }
}

fn default_promotion_interval() -> u64 {
    1000
}

fn default_cron_enabled() -> bool {
    true
}

fn default_cron_interval() -> u64 {
    1000
}

fn default_lock_ttl() -> u64 {
    60
}
