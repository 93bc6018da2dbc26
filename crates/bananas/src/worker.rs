//! Worker pool.
//!
//! A fixed-size fan-out of worker tasks over a shared queue. Each worker
//! loops on a blocking dequeue and hands claimed jobs to the executor;
//! there is no sleep in the hot path. Stop signals cancellation and waits
//! a bounded grace period for in-flight jobs.

use crate::config::{StoreConfig, WorkerConfig};
use crate::error::{BananasError, BananasResult};
use crate::executor::{CancelToken, Executor};
use crate::job::Job;
use crate::metrics::names;
use crate::queue::{Queue, ReadySources};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Fixed-size pool of worker tasks.
pub struct WorkerPool {
    id: String,
    queue: Arc<Queue>,
    executor: Arc<Executor>,
    config: WorkerConfig,
    sources: ReadySources,
    job_filter: Option<Arc<HashSet<String>>>,
    reconnect_base: Duration,
    reconnect_cap: Duration,
    shutdown: CancelToken,
    running: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    /// Creates a pool. Dequeue source keys are precomputed here, once.
    pub fn new(
        queue: Arc<Queue>,
        executor: Arc<Executor>,
        config: WorkerConfig,
        store_config: &StoreConfig,
    ) -> Self {
        let sources = ReadySources::new(queue.keys(), &config.routing_keys, &config.priorities);
        let job_filter = config
            .job_types
            .as_ref()
            .map(|names| Arc::new(names.iter().cloned().collect::<HashSet<_>>()));

        Self {
            id: format!("pool-{}", Uuid::new_v4()),
            queue,
            executor,
            config,
            sources,
            job_filter,
            reconnect_base: Duration::from_secs(store_config.reconnect_base_secs.max(1)),
            reconnect_cap: Duration::from_secs(store_config.reconnect_cap_secs.max(1)),
            shutdown: CancelToken::new(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Pool identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether workers are currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the worker tasks and returns.
    pub fn start(&self) -> BananasResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BananasError::Worker("worker pool already running".to_string()));
        }

        info!(
            pool_id = %self.id,
            concurrency = self.config.concurrency,
            routing_keys = ?self.config.routing_keys,
            priorities = ?self.config.priorities,
            "starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        for index in 0..self.config.concurrency {
            let worker = WorkerLoop {
                id: format!("{}-w{}", self.id, index),
                queue: self.queue.clone(),
                executor: self.executor.clone(),
                sources: self.sources.clone(),
                job_filter: self.job_filter.clone(),
                block_timeout: self.config.block_timeout(),
                reconnect_base: self.reconnect_base,
                reconnect_cap: self.reconnect_cap,
                shutdown: self.shutdown.clone(),
            };
            let span = tracing::info_span!("worker", worker_id = %worker.id);
            tasks.spawn(worker.run().instrument(span));
        }

        gauge!(names::WORKERS_ACTIVE).set(self.config.concurrency as f64);
        Ok(())
    }

    /// Signals cancellation and waits for workers to finish their current
    /// jobs, up to the configured grace period. Workers blocked in a pop
    /// return as soon as their block timeout elapses.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(pool_id = %self.id, "stopping worker pool");
        self.shutdown.cancel();

        let mut tasks = {
            let mut guard = self.tasks.lock();
            std::mem::take(&mut *guard)
        };

        let grace = self.config.shutdown_timeout();
        if timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(
                pool_id = %self.id,
                grace_secs = grace.as_secs(),
                "grace period elapsed, aborting remaining workers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        gauge!(names::WORKERS_ACTIVE).set(0.0);
        info!(pool_id = %self.id, "worker pool stopped");
    }
}

/// One worker task's state.
struct WorkerLoop {
    id: String,
    queue: Arc<Queue>,
    executor: Arc<Executor>,
    sources: ReadySources,
    job_filter: Option<Arc<HashSet<String>>>,
    block_timeout: Duration,
    reconnect_base: Duration,
    reconnect_cap: Duration,
    shutdown: CancelToken,
}

impl WorkerLoop {
    async fn run(self) {
        debug!("worker started");
        let mut backoff = self.reconnect_base;

        // No new dequeue once cancellation is observed.
        while !self.shutdown.is_cancelled() {
            match self.queue.dequeue(&self.sources, self.block_timeout).await {
                Ok(Some(job)) => {
                    backoff = self.reconnect_base;
                    if self.rejected_by_filter(&job).await {
                        // Let a worker that serves this job name claim it.
                        tokio::task::yield_now().await;
                        continue;
                    }
                    self.executor.execute(&self.shutdown, job).await;
                }
                Ok(None) => {
                    // Timeout or orphan; loop straight back into the pop.
                    backoff = self.reconnect_base;
                }
                Err(e) => {
                    counter!(names::STORE_ERRORS_TOTAL).increment(1);
                    error!(error = %e, backoff_secs = backoff.as_secs(), "dequeue failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(self.reconnect_cap);
                }
            }
        }

        debug!("worker stopped");
    }

    /// Applies the job-name allow-list. Rejected jobs go back to the
    /// consumption end of their originating queue so FIFO order within the
    /// priority is preserved.
    async fn rejected_by_filter(&self, job: &Job) -> bool {
        let Some(filter) = &self.job_filter else {
            return false;
        };
        if filter.contains(&job.name) {
            return false;
        }

        debug!(job_id = %job.id, name = %job.name, "job not in allow-list, returning to queue");
        if let Err(e) = self.queue.requeue_front(job).await {
            error!(job_id = %job.id, error = %e, "failed to return filtered job to its queue");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::{QueueConfig, ResultConfig};
    use crate::executor::HandlerRegistry;
    use crate::job::{JobStatus, Priority};
    use crate::keys::Keys;
    use crate::result::ResultBackend;
    use crate::store::MemoryStore;
    use crate::store::Store;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<HandlerRegistry>,
        queue: Arc<Queue>,
        results: Arc<ResultBackend>,
        pool: WorkerPool,
    }

    fn pool_fixture(config: WorkerConfig) -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let keys = Keys::new("bananas");
        let queue = Arc::new(Queue::new(
            store.clone(),
            keys.clone(),
            QueueConfig::default(),
        ));
        let results = Arc::new(ResultBackend::new(
            store.clone(),
            keys,
            ResultConfig::default(),
        ));
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(Executor::new(
            registry.clone(),
            queue.clone(),
            results.clone(),
            config.job_timeout(),
        ));
        let pool = WorkerPool::new(queue.clone(), executor, config, &StoreConfig::default());
        Fixture {
            store,
            registry,
            queue,
            results,
            pool,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            block_timeout_secs: 1,
            shutdown_timeout_secs: 5,
            job_timeout_secs: 5,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_processes_submitted_jobs() {
        let fx = pool_fixture(fast_config());
        fx.registry.register("echo", |_ctx, job: Job| async move {
            Ok(Some(job.payload.clone()))
        });

        let payload = codec::encode_json(&json!({"x": 1})).unwrap();
        let id = fx.queue.enqueue(Job::new("echo", payload)).await.unwrap();

        fx.pool.start().unwrap();

        let result = fx
            .results
            .wait_for_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.error, None);

        fx.pool.stop().await;

        let stored = fx.queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(
            fx.store.llen("bananas:queue:processing").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn single_worker_orders_by_priority() {
        let mut config = fast_config();
        config.concurrency = 1;
        let fx = pool_fixture(config);

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        fx.registry.register("record", move |_ctx, job: Job| {
            let seen = seen.clone();
            async move {
                seen.lock().push(job.description.clone());
                Ok(None)
            }
        });

        // Enqueued lowest priority first; executed highest first.
        for (priority, label) in [
            (Priority::Low, "A"),
            (Priority::Normal, "B"),
            (Priority::High, "C"),
        ] {
            fx.queue
                .enqueue(
                    Job::new("record", Vec::new())
                        .with_priority(priority)
                        .with_description(label),
                )
                .await
                .unwrap();
        }

        fx.pool.start().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        fx.pool.stop().await;

        assert_eq!(*order.lock(), vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn job_filter_requeues_disallowed_jobs() {
        let mut config = fast_config();
        config.concurrency = 1;
        config.job_types = Some(vec!["allowed".to_string()]);
        let fx = pool_fixture(config);

        fx.registry.register("allowed", |_ctx, _job| async move { Ok(None) });

        // The allowed job sits ahead of the disallowed one in FIFO order.
        let allowed = fx
            .queue
            .enqueue(Job::new("allowed", Vec::new()))
            .await
            .unwrap();
        let blocked = fx
            .queue
            .enqueue(Job::new("blocked", Vec::new()))
            .await
            .unwrap();

        fx.pool.start().unwrap();

        let result = fx
            .results
            .wait_for_result(&allowed, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.error, None);

        fx.pool.stop().await;

        // The disallowed job is back in its ready queue, untouched.
        let stored = fx.queue.get_job(&blocked).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(
            fx.queue
                .queue_depth("default", Priority::Normal)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn clean_shutdown_leaves_processing_empty() {
        let fx = pool_fixture(fast_config());
        fx.registry.register("quick", |_ctx, _job| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(None)
        });

        for _ in 0..5 {
            fx.queue.enqueue(Job::new("quick", Vec::new())).await.unwrap();
        }

        fx.pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        fx.pool.stop().await;

        assert_eq!(
            fx.queue
                .queue_depth("default", Priority::Normal)
                .await
                .unwrap(),
            0
        );
        // Clean shutdown leaves nothing stranded in processing.
        assert_eq!(
            fx.store.llen("bananas:queue:processing").await.unwrap(),
            0
        );
        assert!(!fx.pool.is_running());
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let fx = pool_fixture(fast_config());
        fx.pool.start().unwrap();
        assert!(fx.pool.start().is_err());
        fx.pool.stop().await;
    }
}
