//! Handler registry and job execution.
//!
//! The executor resolves a job's handler by name, runs it as a supervised
//! task under the per-job deadline, and reports the outcome to the queue
//! engine and the result backend. A panicking handler never takes its
//! worker down; the panic payload becomes an ordinary retryable failure.

use crate::error::{BananasError, BananasResult};
use crate::job::{Job, JobId};
use crate::metrics::names;
use crate::queue::Queue;
use crate::result::{JobResult, ResultBackend};
use futures::future::BoxFuture;
use metrics::histogram;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

/// Cooperative cancellation handle passed to handlers.
///
/// Cancellation is advisory: a handler that ignores it is dropped at the
/// deadline anyway, but a handler that observes it can stop side effects
/// early during shutdown.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Creates an uncancelled root token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child token; cancelling the parent cancels the child, but
    /// not the other way around.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Signals cancellation to all observers of this token and its
    /// children.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been signalled here or on an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }

    /// Resolves once cancellation is signalled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_cancelled() {
                    return;
                }
                match &self.inner.parent {
                    Some(parent) => {
                        let from_parent: BoxFuture<'_, ()> = parent.cancelled();
                        tokio::select! {
                            _ = notified => {}
                            _ = from_parent => return,
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }
}

/// Execution context handed to handlers alongside the job.
#[derive(Clone)]
pub struct JobContext {
    /// Job being executed.
    pub job_id: JobId,
    /// Failed-attempt count before this execution.
    pub attempt: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Instant at which the execution deadline expires.
    pub deadline: Instant,
    /// Cooperative cancellation token for this execution.
    pub cancel: CancelToken,
}

impl JobContext {
    /// Whether this execution is the last one before dead-lettering.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// Boxed handler future: optional result bytes or an error.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Vec<u8>>, BananasError>>;

/// A registered handler.
pub type Handler = Arc<dyn Fn(JobContext, Job) -> HandlerFuture + Send + Sync>;

/// In-process map from job name to handler.
///
/// Read-mostly: registration happens during startup, lookups happen on the
/// hot path under a read lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<u8>>, BananasError>> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler = Arc::new(move |ctx, job| Box::pin(handler(ctx, job)));
        self.handlers.write().insert(name.clone(), handler);
        debug!(job_name = %name, "registered handler");
    }

    /// Looks up a handler by name.
    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.read().get(name).cloned()
    }

    /// Registered handler names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Whether any handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Runs jobs and reports outcomes.
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    queue: Arc<Queue>,
    results: Arc<ResultBackend>,
    job_timeout: Duration,
}

impl Executor {
    /// Creates an executor.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        queue: Arc<Queue>,
        results: Arc<ResultBackend>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            results,
            job_timeout,
        }
    }

    /// Executes one job to a terminal report.
    ///
    /// Every outcome funnels into exactly one of `Queue::complete` or
    /// `Queue::fail`, followed by a best-effort result store. Queue errors
    /// during the report are logged; a result-store failure never causes a
    /// completed job to be retried.
    pub async fn execute(&self, shutdown: &CancelToken, job: Job) {
        let started = Instant::now();
        let outcome = self.run_handler(shutdown, &job).await;
        let duration = started.elapsed();
        histogram!(names::JOB_DURATION_SECONDS).record(duration.as_secs_f64());

        match outcome {
            Ok(result_bytes) => {
                debug!(job_id = %job.id, name = %job.name, ?duration, "job succeeded");
                if let Err(e) = self.queue.complete(&job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
                let record = JobResult::success(job.id.clone(), result_bytes, duration);
                if let Err(e) = self.results.store_result(&record).await {
                    warn!(job_id = %job.id, error = %e, "failed to store job result");
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(job_id = %job.id, name = %job.name, error = %message, "job failed");
                // The typed error decides retry vs immediate dead-letter.
                if let Err(e) = self.queue.fail(&job, &err).await {
                    error!(job_id = %job.id, error = %e, "failed to record job failure");
                }
                let record = JobResult::failure(job.id.clone(), message, duration);
                if let Err(e) = self.results.store_result(&record).await {
                    warn!(job_id = %job.id, error = %e, "failed to store job result");
                }
            }
        }
    }

    async fn run_handler(
        &self,
        shutdown: &CancelToken,
        job: &Job,
    ) -> BananasResult<Option<Vec<u8>>> {
        let Some(handler) = self.registry.get(&job.name) else {
            return Err(BananasError::HandlerNotFound(job.name.clone()));
        };

        let cancel = shutdown.child();
        let ctx = JobContext {
            job_id: job.id.clone(),
            attempt: job.attempts,
            max_retries: job.max_retries,
            deadline: Instant::now() + self.job_timeout,
            cancel: cancel.clone(),
        };

        // Supervised task: a panic in the handler surfaces as a JoinError
        // instead of unwinding through the worker.
        let mut task = tokio::spawn(handler(ctx, job.clone()));

        match timeout(self.job_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    Err(BananasError::HandlerPanic(panic_message(join_err)))
                } else {
                    Err(BananasError::Worker("handler task was cancelled".to_string()))
                }
            }
            Err(_elapsed) => {
                cancel.cancel();
                task.abort();
                Err(BananasError::Timeout(self.job_timeout.as_secs()))
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
