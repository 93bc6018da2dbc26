//! Result backend.
//!
//! Stores one record per finished job under `result:{id}` with a TTL
//! differentiated by outcome, publishes a notification on the job's result
//! channel, and supports blocking waits via subscribe-then-recheck so no
//! notification can be missed. Result storage is best-effort and never
//! gates a queue state transition.

use crate::config::ResultConfig;
use crate::error::{BananasError, BananasResult};
use crate::job::JobId;
use crate::keys::Keys;
use crate::store::{Store, StoreOp};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Message published on a job's result channel when its record commits.
pub const READY_MESSAGE: &str = "ready";

/// Outcome of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl ResultStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ResultStatus::Completed),
            "failed" => Some(ResultStatus::Failed),
            _ => None,
        }
    }
}

/// A per-job result record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: ResultStatus,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    /// Handler output bytes; present only on success.
    pub result: Option<Vec<u8>>,
    /// Error message; present only on failure.
    pub error: Option<String>,
}

impl JobResult {
    /// Builds a success record.
    pub fn success(job_id: JobId, result: Option<Vec<u8>>, duration: Duration) -> Self {
        Self {
            job_id,
            status: ResultStatus::Completed,
            completed_at: Utc::now(),
            duration,
            result,
            error: None,
        }
    }

    /// Builds a failure record.
    pub fn failure(job_id: JobId, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            job_id,
            status: ResultStatus::Failed,
            completed_at: Utc::now(),
            duration,
            result: None,
            error: Some(error.into()),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            (
                "completed_at".to_string(),
                self.completed_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (
                "duration_ms".to_string(),
                self.duration.as_millis().to_string(),
            ),
        ];
        match self.status {
            ResultStatus::Completed => {
                // The hash field goes through a string-typed store API;
                // base64 keeps arbitrary bytes intact.
                let encoded = BASE64.encode(self.result.as_deref().unwrap_or_default());
                fields.push(("result".to_string(), encoded));
            }
            ResultStatus::Failed => {
                fields.push((
                    "error".to_string(),
                    self.error.clone().unwrap_or_default(),
                ));
            }
        }
        fields
    }

    fn from_fields(job_id: &JobId, fields: &HashMap<String, String>) -> BananasResult<Self> {
        let malformed = |what: &str| {
            BananasError::MalformedPayload(format!(
                "result record for job {} has invalid {}",
                job_id, what
            ))
        };

        let status = fields
            .get("status")
            .and_then(|s| ResultStatus::parse(s))
            .ok_or_else(|| malformed("status"))?;

        let completed_at = fields
            .get("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| malformed("completed_at"))?;

        let duration_ms: u64 = fields
            .get("duration_ms")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("duration_ms"))?;

        let result = match status {
            ResultStatus::Completed => Some(
                fields
                    .get("result")
                    .map(|encoded| BASE64.decode(encoded))
                    .transpose()
                    .map_err(|_| malformed("result"))?
                    .unwrap_or_default(),
            ),
            ResultStatus::Failed => None,
        };

        let error = match status {
            ResultStatus::Failed => Some(fields.get("error").cloned().unwrap_or_default()),
            ResultStatus::Completed => None,
        };

        Ok(Self {
            job_id: job_id.clone(),
            status,
            completed_at,
            duration: Duration::from_millis(duration_ms),
            result,
            error,
        })
    }
}

/// Store-backed result backend.
pub struct ResultBackend {
    store: Arc<dyn Store>,
    keys: Keys,
    config: ResultConfig,
}

impl ResultBackend {
    /// Creates a result backend over the given store.
    pub fn new(store: Arc<dyn Store>, keys: Keys, config: ResultConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Whether result storage is enabled at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Commits a result record and notifies waiters. One pipeline: hash
    /// write, TTL, publish.
    pub async fn store_result(&self, result: &JobResult) -> BananasResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let ttl_secs = match result.status {
            ResultStatus::Completed => self.config.success_ttl_secs,
            ResultStatus::Failed => self.config.failure_ttl_secs,
        };

        let key = self.keys.result(result.job_id.as_str());
        self.store
            .pipeline(vec![
                StoreOp::HSet {
                    key: key.clone(),
                    fields: result.to_fields(),
                },
                StoreOp::Expire { key, ttl_secs },
                StoreOp::Publish {
                    channel: self.keys.result_channel(result.job_id.as_str()),
                    message: READY_MESSAGE.to_string(),
                },
            ])
            .await?;

        debug!(job_id = %result.job_id, status = result.status.as_str(), "stored job result");
        Ok(())
    }

    /// Fetches a result record, or `None` if absent or expired.
    pub async fn get_result(&self, job_id: &JobId) -> BananasResult<Option<JobResult>> {
        let fields = self.store.hgetall(&self.keys.result(job_id.as_str())).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobResult::from_fields(job_id, &fields)?))
    }

    /// Blocks until the job's result is available or `timeout` elapses.
    ///
    /// The subscription is opened between two reads so a result committed
    /// at any point is observed: either by the first read, by the re-check
    /// after the subscription is confirmed, or by the notification. On
    /// timeout a final read is attempted before reporting
    /// [`BananasError::ResultTimeout`]. Any number of concurrent waiters
    /// may wait on the same id.
    pub async fn wait_for_result(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> BananasResult<JobResult> {
        let deadline = Instant::now() + timeout;

        // The job may already be finished.
        if let Some(result) = self.get_result(job_id).await? {
            return Ok(result);
        }

        let mut subscription = self
            .store
            .subscribe(&self.keys.result_channel(job_id.as_str()))
            .await?;

        // The result may have landed between the first read and the
        // subscription being confirmed.
        if let Some(result) = self.get_result(job_id).await? {
            return Ok(result);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, subscription.recv()).await {
                Ok(Some(_message)) => {
                    if let Some(result) = self.get_result(job_id).await? {
                        return Ok(result);
                    }
                    // Notification without a readable record; keep waiting.
                }
                // Subscription closed or timed out: fall through to the
                // final read.
                Ok(None) | Err(_) => break,
            }
        }

        match self.get_result(job_id).await? {
            Some(result) => Ok(result),
            None => Err(BananasError::ResultTimeout(job_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn backend() -> ResultBackend {
        ResultBackend::new(
            Arc::new(MemoryStore::new()),
            Keys::new("bananas"),
            ResultConfig::default(),
        )
    }

    #[tokio::test]
    async fn store_then_get_round_trip() {
        let backend = backend();
        let id = JobId::from("J1");
        let stored = JobResult::success(id.clone(), Some(b"out".to_vec()), Duration::from_millis(42));

        backend.store_result(&stored).await.unwrap();

        let fetched = backend.get_result(&id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ResultStatus::Completed);
        assert_eq!(fetched.result.as_deref(), Some(b"out".as_slice()));
        assert_eq!(fetched.error, None);
        assert_eq!(fetched.duration, Duration::from_millis(42));
    }

    #[tokio::test]
    async fn failure_record_carries_error() {
        let backend = backend();
        let id = JobId::from("J2");
        backend
            .store_result(&JobResult::failure(id.clone(), "boom", Duration::from_millis(7)))
            .await
            .unwrap();

        let fetched = backend.get_result(&id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ResultStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
        assert_eq!(fetched.result, None);
    }

    #[tokio::test]
    async fn absent_result_is_none() {
        let backend = backend();
        assert!(backend
            .get_result(&JobId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn wait_returns_existing_result_immediately() {
        let backend = backend();
        let id = JobId::from("J3");
        backend
            .store_result(&JobResult::success(id.clone(), None, Duration::ZERO))
            .await
            .unwrap();

        let result = backend
            .wait_for_result(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
    }

    #[tokio::test]
    async fn wait_observes_notification() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ResultBackend::new(
            store,
            Keys::new("bananas"),
            ResultConfig::default(),
        ));
        let id = JobId::from("J4");

        let waiter = backend.clone();
        let waiter_id = id.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_result(&waiter_id, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend
            .store_result(&JobResult::success(id, Some(b"late".to_vec()), Duration::ZERO))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(result.result.as_deref(), Some(b"late".as_slice()));
    }

    #[tokio::test]
    async fn concurrent_waiters_all_observe() {
        let backend = Arc::new(backend());
        let id = JobId::from("J5");

        let mut handles = Vec::new();
        for _ in 0..3 {
            let waiter = backend.clone();
            let waiter_id = id.clone();
            handles.push(tokio::spawn(async move {
                waiter
                    .wait_for_result(&waiter_id, Duration::from_secs(5))
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend
            .store_result(&JobResult::success(id, None, Duration::ZERO))
            .await
            .unwrap();

        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("waiter should wake")
                .unwrap()
                .unwrap();
            assert_eq!(result.status, ResultStatus::Completed);
        }
    }

    #[tokio::test]
    async fn wait_timeout_is_typed() {
        let backend = backend();
        let err = backend
            .wait_for_result(&JobId::from("never"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BananasError::ResultTimeout(_)));
    }

    #[tokio::test]
    async fn disabled_backend_stores_nothing() {
        let backend = ResultBackend::new(
            Arc::new(MemoryStore::new()),
            Keys::new("bananas"),
            ResultConfig {
                enabled: false,
                ..ResultConfig::default()
            },
        );
        let id = JobId::from("J6");
        backend
            .store_result(&JobResult::success(id.clone(), None, Duration::ZERO))
            .await
            .unwrap();
        assert!(backend.get_result(&id).await.unwrap().is_none());
    }
}
