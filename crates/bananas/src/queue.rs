//! Queue engine.
//!
//! Owns the key layout and every job state transition: enqueue, dequeue,
//! completion, failure with retry scheduling, promotion of due delayed
//! jobs, dead-letter routing, and the reaper hook for stranded processing
//! entries. Composite mutations are pipelined so a batch of N jobs costs
//! O(1) store round trips.

use crate::config::QueueConfig;
use crate::error::{BananasError, BananasResult};
use crate::job::{
    validate_routing_key, Job, JobId, JobStatus, Priority, DEFAULT_ROUTING_KEY,
};
use crate::keys::Keys;
use crate::metrics::names;
use crate::store::{Store, StoreOp};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Precomputed dequeue source list for a worker's (routing keys, priorities)
/// configuration. Built once at pool construction, not per call.
#[derive(Debug, Clone)]
pub struct ReadySources {
    keys: Vec<String>,
}

impl ReadySources {
    /// Builds the ordered source list: routing keys outer, priorities inner.
    pub fn new(keys: &Keys, routing_keys: &[String], priorities: &[Priority]) -> Self {
        Self {
            keys: keys.ready_sources(routing_keys, priorities),
        }
    }

    /// The ordered source keys.
    pub fn as_keys(&self) -> &[String] {
        &self.keys
    }
}

/// Store-backed queue engine.
pub struct Queue {
    store: Arc<dyn Store>,
    keys: Keys,
    config: QueueConfig,
}

impl Queue {
    /// Creates a queue engine over the given store.
    pub fn new(store: Arc<dyn Store>, keys: Keys, config: QueueConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// The key layout in use.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Submits a job.
    ///
    /// An empty routing key defaults to `"default"`; invalid keys are
    /// refused. Jobs carrying a `scheduled_for` time go to the delayed set
    /// instead of a ready queue.
    pub async fn enqueue(&self, mut job: Job) -> BananasResult<JobId> {
        if job.routing_key.is_empty() {
            job.routing_key = DEFAULT_ROUTING_KEY.to_string();
        }
        validate_routing_key(&job.routing_key)?;

        let id = job.id.clone();
        job.touch();

        let ops = match (job.status, job.scheduled_for) {
            (JobStatus::Scheduled, Some(at)) => vec![
                StoreOp::Set {
                    key: self.keys.job(id.as_str()),
                    value: job.to_json()?,
                },
                StoreOp::ZAdd {
                    key: self.keys.scheduled().to_string(),
                    member: id.to_string(),
                    score: at.timestamp() as f64,
                },
            ],
            _ => {
                job.status = JobStatus::Pending;
                job.scheduled_for = None;
                vec![
                    StoreOp::Set {
                        key: self.keys.job(id.as_str()),
                        value: job.to_json()?,
                    },
                    StoreOp::LPush {
                        key: self.keys.ready(&job.routing_key, job.priority),
                        value: id.to_string(),
                    },
                ]
            }
        };

        self.store.pipeline(ops).await?;
        counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);

        debug!(
            job_id = %id,
            name = %job.name,
            routing_key = %job.routing_key,
            priority = %job.priority,
            status = %job.status,
            "enqueued job"
        );

        Ok(id)
    }

    /// Submits a job for execution at `at`.
    pub async fn enqueue_at(&self, job: Job, at: DateTime<Utc>) -> BananasResult<JobId> {
        self.enqueue(job.scheduled_at(at)).await
    }

    /// Claims the next available job from the given sources.
    ///
    /// Blocks up to `block_timeout`. Returns `None` on timeout, and also
    /// when the popped id turned out to be an orphan (the caller just loops
    /// again). The returned job has been marked `processing`.
    pub async fn dequeue(
        &self,
        sources: &ReadySources,
        block_timeout: Duration,
    ) -> BananasResult<Option<Job>> {
        let Some(id) = self
            .store
            .brpoplpush(sources.as_keys(), self.keys.processing(), block_timeout)
            .await?
        else {
            return Ok(None);
        };

        let record = self.store.get(&self.keys.job(&id)).await?;

        let mut job = match record.as_deref().map(Job::from_json) {
            Some(Ok(job)) => job,
            Some(Err(e)) => {
                // Undecodable record: route the id to the DLQ, no retries.
                warn!(job_id = %id, error = %e, "dequeued job with malformed record, moving to dead-letter queue");
                self.store
                    .pipeline(vec![
                        StoreOp::LRem {
                            key: self.keys.processing().to_string(),
                            count: 1,
                            value: id.clone(),
                        },
                        StoreOp::LPush {
                            key: self.keys.dead().to_string(),
                            value: id.clone(),
                        },
                    ])
                    .await?;
                counter!(names::JOBS_ORPHANED_TOTAL).increment(1);
                return Ok(None);
            }
            None => {
                // Record vanished (expired or purged); drop the id.
                warn!(job_id = %id, "dequeued id with no job record, discarding");
                self.store
                    .lrem(self.keys.processing(), 1, &id)
                    .await?;
                counter!(names::JOBS_ORPHANED_TOTAL).increment(1);
                return Ok(None);
            }
        };

        job.status = JobStatus::Processing;
        job.scheduled_for = None;
        job.touch();
        self.store
            .set(&self.keys.job(&id), &job.to_json()?)
            .await?;

        counter!(names::JOBS_DEQUEUED_TOTAL).increment(1);
        debug!(job_id = %id, name = %job.name, attempt = job.attempts, "dequeued job");

        Ok(Some(job))
    }

    /// Marks a job completed. Idempotent.
    pub async fn complete(&self, job_id: &JobId) -> BananasResult<()> {
        let Some(record) = self.store.get(&self.keys.job(job_id.as_str())).await? else {
            // Record already expired; nothing to transition.
            return Ok(());
        };

        let mut job = Job::from_json(&record)
            .map_err(|_| BananasError::MalformedJob(job_id.to_string()))?;

        if job.status == JobStatus::Completed {
            return Ok(());
        }

        job.status = JobStatus::Completed;
        job.error.clear();
        job.scheduled_for = None;
        job.touch();

        self.store
            .pipeline(vec![
                StoreOp::LRem {
                    key: self.keys.processing().to_string(),
                    count: 1,
                    value: job_id.to_string(),
                },
                StoreOp::SetEx {
                    key: self.keys.job(job_id.as_str()),
                    value: job.to_json()?,
                    ttl_secs: self.config.completed_ttl_secs,
                },
            ])
            .await?;

        counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
        debug!(job_id = %job_id, "completed job");
        Ok(())
    }

    /// Records a failed execution: schedules a retry with exponential
    /// backoff while budget remains, otherwise dead-letters the job.
    ///
    /// Errors that prove the job structurally broken
    /// ([`BananasError::is_retryable`] is false) dead-letter immediately
    /// without consuming retries.
    pub async fn fail(&self, job: &Job, error: &BananasError) -> BananasResult<()> {
        // Re-read the live record; the executor's copy may be stale.
        let mut live = match self.store.get(&self.keys.job(job.id.as_str())).await? {
            Some(record) => Job::from_json(&record).unwrap_or_else(|_| job.clone()),
            None => job.clone(),
        };

        counter!(names::JOBS_FAILED_TOTAL).increment(1);
        let error_msg = error.to_string();

        let next_attempt = live.attempts + 1;
        if error.is_retryable() && next_attempt <= live.max_retries {
            live.attempts = next_attempt;
            let backoff = Job::backoff_seconds(live.attempts);
            let fire_at = Utc::now() + ChronoDuration::seconds(backoff as i64);

            live.status = JobStatus::Scheduled;
            live.scheduled_for = Some(fire_at);
            live.error = error_msg.clone();
            live.touch();

            self.store
                .pipeline(vec![
                    StoreOp::LRem {
                        key: self.keys.processing().to_string(),
                        count: 1,
                        value: live.id.to_string(),
                    },
                    StoreOp::ZAdd {
                        key: self.keys.scheduled().to_string(),
                        member: live.id.to_string(),
                        score: fire_at.timestamp() as f64,
                    },
                    StoreOp::Set {
                        key: self.keys.job(live.id.as_str()),
                        value: live.to_json()?,
                    },
                ])
                .await?;

            counter!(names::JOBS_RETRIED_TOTAL).increment(1);
            debug!(
                job_id = %live.id,
                attempt = live.attempts,
                backoff_secs = backoff,
                error = %error_msg,
                "scheduled retry"
            );
        } else {
            live.status = JobStatus::Failed;
            live.scheduled_for = None;
            live.error = error_msg.clone();
            live.touch();

            self.store
                .pipeline(vec![
                    StoreOp::LRem {
                        key: self.keys.processing().to_string(),
                        count: 1,
                        value: live.id.to_string(),
                    },
                    StoreOp::LPush {
                        key: self.keys.dead().to_string(),
                        value: live.id.to_string(),
                    },
                    StoreOp::SetEx {
                        key: self.keys.job(live.id.as_str()),
                        value: live.to_json()?,
                        ttl_secs: self.config.failed_ttl_secs,
                    },
                ])
                .await?;

            counter!(names::JOBS_DEAD_LETTERED_TOTAL).increment(1);
            let reason = if error.is_retryable() {
                "retries exhausted"
            } else {
                "unrecoverable error"
            };
            warn!(
                job_id = %live.id,
                attempts = live.attempts,
                error = %error_msg,
                "{}, moved job to dead-letter queue",
                reason
            );
        }

        Ok(())
    }

    /// Moves all delayed jobs whose fire time has arrived into their ready
    /// queues. One scan, one batch fetch, one pipeline. Returns the number
    /// of jobs promoted.
    pub async fn move_scheduled_to_ready(&self) -> BananasResult<u64> {
        let now = Utc::now().timestamp() as f64;
        let ids = self
            .store
            .zrangebyscore_upto(self.keys.scheduled(), now)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let record_keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let records = self.store.mget(&record_keys).await?;

        let mut ops = Vec::with_capacity(ids.len() * 3);
        let mut promoted = 0u64;

        for (id, record) in ids.iter().zip(records) {
            let job = record.as_deref().and_then(|r| Job::from_json(r).ok());

            match job {
                Some(mut job) => {
                    job.status = JobStatus::Pending;
                    job.scheduled_for = None;
                    job.touch();

                    ops.push(StoreOp::LPush {
                        key: self.keys.ready(&job.routing_key, job.priority),
                        value: id.clone(),
                    });
                    ops.push(StoreOp::ZRem {
                        key: self.keys.scheduled().to_string(),
                        member: id.clone(),
                    });
                    ops.push(StoreOp::Set {
                        key: self.keys.job(id),
                        value: job.to_json()?,
                    });
                    promoted += 1;
                }
                None => {
                    // Missing or undecodable record: drop from the set.
                    ops.push(StoreOp::ZRem {
                        key: self.keys.scheduled().to_string(),
                        member: id.clone(),
                    });
                }
            }
        }

        self.store.pipeline(ops).await?;

        if promoted > 0 {
            counter!(names::JOBS_PROMOTED_TOTAL).increment(promoted);
            debug!(count = promoted, "promoted delayed jobs");
        }

        Ok(promoted)
    }

    /// Fetches a job record, or `None` if absent or expired.
    pub async fn get_job(&self, job_id: &JobId) -> BananasResult<Option<Job>> {
        match self.store.get(&self.keys.job(job_id.as_str())).await? {
            Some(record) => Ok(Some(Job::from_json(&record).map_err(|_| {
                BananasError::MalformedJob(job_id.to_string())
            })?)),
            None => Ok(None),
        }
    }

    /// Number of ready jobs for a (routing key, priority) pair.
    pub async fn queue_depth(&self, routing_key: &str, priority: Priority) -> BananasResult<u64> {
        self.store.llen(&self.keys.ready(routing_key, priority)).await
    }

    /// Number of ids in the dead-letter queue.
    pub async fn dead_letter_len(&self) -> BananasResult<u64> {
        self.store.llen(self.keys.dead()).await
    }

    /// Fetches up to `limit` jobs from the dead-letter queue, newest first.
    pub async fn list_dead(&self, limit: u64) -> BananasResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .store
            .lrange(self.keys.dead(), 0, limit as i64 - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let record_keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let records = self.store.mget(&record_keys).await?;

        Ok(records
            .into_iter()
            .flatten()
            .filter_map(|r| Job::from_json(&r).ok())
            .collect())
    }

    /// Returns a dead-lettered job to its ready queue with a fresh retry
    /// budget. Human-operated recovery; the DLQ is never drained
    /// automatically.
    pub async fn requeue_dead(&self, job_id: &JobId) -> BananasResult<Option<JobId>> {
        let Some(mut job) = self.get_job(job_id).await? else {
            return Ok(None);
        };

        let removed = self.store.lrem(self.keys.dead(), 1, job_id.as_str()).await?;
        if removed == 0 {
            return Ok(None);
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.error.clear();
        job.scheduled_for = None;
        job.touch();

        self.store
            .pipeline(vec![
                // Plain Set clears the failed-record TTL.
                StoreOp::Set {
                    key: self.keys.job(job_id.as_str()),
                    value: job.to_json()?,
                },
                StoreOp::LPush {
                    key: self.keys.ready(&job.routing_key, job.priority),
                    value: job_id.to_string(),
                },
            ])
            .await?;

        debug!(job_id = %job_id, "requeued job from dead-letter queue");
        Ok(Some(job_id.clone()))
    }

    /// Deletes a job record and removes its id from every queue structure.
    pub async fn purge(&self, job_id: &JobId) -> BananasResult<()> {
        let job = self.get_job(job_id).await?;

        let mut ops = vec![
            StoreOp::Del {
                key: self.keys.job(job_id.as_str()),
            },
            StoreOp::LRem {
                key: self.keys.processing().to_string(),
                count: 0,
                value: job_id.to_string(),
            },
            StoreOp::LRem {
                key: self.keys.dead().to_string(),
                count: 0,
                value: job_id.to_string(),
            },
            StoreOp::ZRem {
                key: self.keys.scheduled().to_string(),
                member: job_id.to_string(),
            },
        ];

        if let Some(job) = job {
            ops.push(StoreOp::LRem {
                key: self.keys.ready(&job.routing_key, job.priority),
                count: 0,
                value: job_id.to_string(),
            });
        }

        self.store.pipeline(ops).await?;
        Ok(())
    }

    /// Pushes a dequeued job back to the consumption end of its ready
    /// queue, preserving FIFO order. Used by job-name filtering.
    pub async fn requeue_front(&self, job: &Job) -> BananasResult<()> {
        let mut restored = job.clone();
        restored.status = JobStatus::Pending;
        restored.touch();

        self.store
            .pipeline(vec![
                StoreOp::LRem {
                    key: self.keys.processing().to_string(),
                    count: 1,
                    value: job.id.to_string(),
                },
                StoreOp::RPush {
                    key: self.keys.ready(&job.routing_key, job.priority),
                    value: job.id.to_string(),
                },
                StoreOp::Set {
                    key: self.keys.job(job.id.as_str()),
                    value: restored.to_json()?,
                },
            ])
            .await?;
        Ok(())
    }

    /// Requeues jobs stranded in the processing list longer than
    /// `threshold`.
    ///
    /// A worker crash leaves its claimed ids in `queue:processing`; this
    /// scan returns those whose record still says `processing` after the
    /// threshold. A threshold shorter than the longest legitimate job will
    /// double-execute; at-least-once delivery makes that survivable, so the
    /// policy is left to deployment configuration.
    pub async fn reap_processing(&self, threshold: Duration) -> BananasResult<u64> {
        let ids = self.store.lrange(self.keys.processing(), 0, -1).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let record_keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let records = self.store.mget(&record_keys).await?;

        let cutoff = Utc::now()
            - ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::seconds(0));

        let mut ops = Vec::new();
        let mut reaped = 0u64;

        for (id, record) in ids.iter().zip(records) {
            let Some(mut job) = record.as_deref().and_then(|r| Job::from_json(r).ok()) else {
                continue;
            };
            if job.status != JobStatus::Processing || job.updated_at > cutoff {
                continue;
            }

            job.status = JobStatus::Pending;
            job.touch();

            ops.push(StoreOp::LRem {
                key: self.keys.processing().to_string(),
                count: 1,
                value: id.clone(),
            });
            ops.push(StoreOp::LPush {
                key: self.keys.ready(&job.routing_key, job.priority),
                value: id.clone(),
            });
            ops.push(StoreOp::Set {
                key: self.keys.job(id),
                value: job.to_json()?,
            });
            reaped += 1;

            warn!(job_id = %id, "requeued job stranded in processing");
        }

        if !ops.is_empty() {
            self.store.pipeline(ops).await?;
            counter!(names::JOBS_REAPED_TOTAL).increment(reaped);
        }

        Ok(reaped)
    }

    /// Store health check.
    pub async fn health_check(&self) -> BananasResult<()> {
        self.store.ping().await
    }
}
