//! Error types for the task queue.

use thiserror::Error;

/// Result type for queue operations.
pub type BananasResult<T> = Result<T, BananasError>;

/// Errors produced by the task queue system.
#[derive(Debug, Error)]
pub enum BananasError {
    /// Store connection or I/O failure.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Store connection pool failure.
    #[error("store pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload carries a codec tag this implementation does not know.
    #[error("unsupported payload tag: {0:#04x}")]
    UnsupportedPayloadTag(u8),

    /// Payload bytes are structurally unusable (empty, bad encoding).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Job record exists but cannot be decoded.
    #[error("malformed job record: {0}")]
    MalformedJob(String),

    /// Routing key is empty, too long, or contains invalid characters.
    #[error("invalid routing key: {0:?}")]
    InvalidRoutingKey(String),

    /// Cron expression is not a valid 5-field expression.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// Timezone is not a known IANA zone.
    #[error("invalid timezone: {0:?}")]
    InvalidTimezone(String),

    /// Schedule id does not match the allowed format.
    #[error("invalid schedule id: {0:?}")]
    InvalidScheduleId(String),

    /// No handler registered under the job's name.
    #[error("no handler registered for job {0:?}")]
    HandlerNotFound(String),

    /// Handler terminated abnormally; the diagnostic carries the panic payload.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// Handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Handler exceeded the per-job execution deadline.
    #[error("job timed out after {0} seconds")]
    Timeout(u64),

    /// Waiting for a job result exceeded the caller's timeout.
    #[error("timed out waiting for result of job {0}")]
    ResultTimeout(String),

    /// Configuration is invalid; fatal at bootstrap.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Worker pool lifecycle error.
    #[error("worker error: {0}")]
    Worker(String),

    /// Scheduler lifecycle error.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl BananasError {
    /// Whether a job failing with this error should take the retry path.
    ///
    /// Structurally broken jobs (bad payloads, undecodable records) go
    /// straight to the dead-letter queue without consuming retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BananasError::Store(_)
                | BananasError::Pool(_)
                | BananasError::Handler(_)
                | BananasError::HandlerPanic(_)
                | BananasError::HandlerNotFound(_)
                | BananasError::Timeout(_)
                | BananasError::Worker(_)
        )
    }
}
