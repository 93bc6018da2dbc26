//! Process-level wiring.
//!
//! [`Bananas`] assembles the store, queue engine, result backend, executor,
//! worker pool, and scheduler loops according to the configured worker
//! mode, and owns their start/stop ordering.

use crate::config::BananasConfig;
use crate::error::BananasResult;
use crate::executor::{CancelToken, Executor, HandlerRegistry};
use crate::job::{Job, JobId};
use crate::keys::Keys;
use crate::maintenance;
use crate::queue::Queue;
use crate::result::{JobResult, ResultBackend};
use crate::scheduler::{CronScheduler, ScheduleRegistry};
use crate::store::{RedisStore, Store};
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// The assembled task queue system for one process.
pub struct Bananas {
    config: BananasConfig,
    queue: Arc<Queue>,
    results: Arc<ResultBackend>,
    handlers: Arc<HandlerRegistry>,
    schedules: Arc<ScheduleRegistry>,
    pool: Option<WorkerPool>,
    cron: Arc<CronScheduler>,
    shutdown: CancelToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Bananas {
    /// Connects to the configured store and assembles the system.
    pub async fn connect(config: BananasConfig) -> BananasResult<Self> {
        config.validate()?;
        let store = Arc::new(RedisStore::connect(&config.store).await?);
        Ok(Self::with_store(config, store))
    }

    /// Assembles the system over an existing store. The configuration is
    /// assumed validated.
    pub fn with_store(config: BananasConfig, store: Arc<dyn Store>) -> Self {
        let keys = Keys::new(config.store.key_prefix.clone());

        let queue = Arc::new(Queue::new(
            store.clone(),
            keys.clone(),
            config.queue.clone(),
        ));
        let results = Arc::new(ResultBackend::new(
            store.clone(),
            keys.clone(),
            config.result.clone(),
        ));
        let handlers = Arc::new(HandlerRegistry::new());
        let schedules = Arc::new(ScheduleRegistry::new());

        let executor = Arc::new(Executor::new(
            handlers.clone(),
            queue.clone(),
            results.clone(),
            config.worker.job_timeout(),
        ));

        let pool = config.worker.mode.pool_enabled().then(|| {
            WorkerPool::new(
                queue.clone(),
                executor,
                config.worker.clone(),
                &config.store,
            )
        });

        let cron = Arc::new(CronScheduler::new(
            store,
            queue.clone(),
            schedules.clone(),
            keys,
            config.scheduler.lock_ttl_secs,
        ));

        Self {
            config,
            queue,
            results,
            handlers,
            schedules,
            pool,
            cron,
            shutdown: CancelToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// The handler registry; register handlers before calling `start`.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The schedule registry; register schedules before calling `start`.
    pub fn schedules(&self) -> &ScheduleRegistry {
        &self.schedules
    }

    /// The queue engine, for submissions and inspection.
    pub fn queue(&self) -> Arc<Queue> {
        self.queue.clone()
    }

    /// The result backend.
    pub fn results(&self) -> Arc<ResultBackend> {
        self.results.clone()
    }

    /// Creates a job carrying this process's configured defaults
    /// (currently the retry budget). Builder methods still override.
    pub fn job(&self, name: impl Into<String>, payload: Vec<u8>) -> Job {
        Job::new(name, payload).with_max_retries(self.config.worker.max_retries)
    }

    /// Submits a job for immediate execution.
    pub async fn submit(&self, job: Job) -> BananasResult<JobId> {
        self.queue.enqueue(job).await
    }

    /// Submits a job for execution at `at`.
    pub async fn submit_at(&self, job: Job, at: DateTime<Utc>) -> BananasResult<JobId> {
        self.queue.enqueue_at(job, at).await
    }

    /// Blocks until the job's result is available or `timeout` elapses.
    pub async fn wait_for_result(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> BananasResult<JobResult> {
        self.results.wait_for_result(job_id, timeout).await
    }

    /// Starts the components selected by the worker mode.
    pub fn start(&self) -> BananasResult<()> {
        let mode = self.config.worker.mode;
        info!(mode = ?mode, "starting bananas runtime");

        if let Some(pool) = &self.pool {
            pool.start()?;
        }

        if mode.scheduler_in_process() {
            let mut loops = self.loops.lock();

            loops.push(tokio::spawn(maintenance::run_promoter(
                self.queue.clone(),
                self.config.scheduler.promotion_interval(),
                self.shutdown.clone(),
            )));

            if self.config.scheduler.cron_enabled {
                let cron = self.cron.clone();
                let interval = self.config.scheduler.cron_interval();
                let shutdown = self.shutdown.clone();
                loops.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Err(e) = cron.tick().await {
                                    tracing::warn!(error = %e, "cron tick failed");
                                }
                            }
                        }
                    }
                }));
            }

            if let Some(threshold_secs) = self.config.queue.reap_after_secs {
                loops.push(tokio::spawn(maintenance::run_reaper(
                    self.queue.clone(),
                    Duration::from_secs(threshold_secs),
                    self.config.scheduler.promotion_interval(),
                    self.shutdown.clone(),
                )));
            }
        }

        Ok(())
    }

    /// Stops everything: workers first (bounded by the shutdown grace),
    /// then the scheduler loops.
    pub async fn stop(&self) {
        info!("stopping bananas runtime");

        if let Some(pool) = &self.pool {
            pool.stop().await;
        }

        self.shutdown.cancel();
        let loops = {
            let mut guard = self.loops.lock();
            std::mem::take(&mut *guard)
        };
        for handle in loops {
            let _ = handle.await;
        }

        info!("bananas runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerMode;
    use crate::store::MemoryStore;

    fn config(mode: WorkerMode) -> BananasConfig {
        let mut config = BananasConfig::default();
        config.worker.mode = mode;
        config.worker.concurrency = 2;
        config.worker.block_timeout_secs = 1;
        config.scheduler.promotion_interval_ms = 20;
        config.scheduler.cron_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn thin_mode_runs_workers_and_promotion() {
        let runtime = Bananas::with_store(
            config(WorkerMode::Thin),
            Arc::new(MemoryStore::new()),
        );
        runtime
            .handlers()
            .register("echo", |_ctx, job: Job| async move {
                Ok(Some(job.payload.clone()))
            });

        runtime.start().unwrap();

        // A delayed submission is promoted and then executed in-process.
        let at = Utc::now() - chrono::Duration::seconds(1);
        let id = runtime
            .submit_at(Job::new("echo", Vec::new()), at)
            .await
            .unwrap();

        let result = runtime
            .wait_for_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.error, None);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn scheduler_only_mode_has_no_pool() {
        let runtime = Bananas::with_store(
            config(WorkerMode::SchedulerOnly),
            Arc::new(MemoryStore::new()),
        );
        assert!(runtime.pool.is_none());

        runtime.start().unwrap();

        // Promotion still happens without any workers.
        let at = Utc::now() - chrono::Duration::seconds(1);
        let id = runtime
            .submit_at(Job::new("nobody", Vec::new()), at)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = runtime.queue().get_job(&id).await.unwrap().unwrap();
            if job.status == crate::job::JobStatus::Pending {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "promotion did not run");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        runtime.stop().await;
    }

    #[tokio::test]
    async fn default_mode_does_not_run_scheduler_loops() {
        let runtime = Bananas::with_store(
            config(WorkerMode::Default),
            Arc::new(MemoryStore::new()),
        );
        runtime.start().unwrap();
        assert!(runtime.loops.lock().is_empty());
        runtime.stop().await;
    }
}
