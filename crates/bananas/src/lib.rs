//! Bananas - Distributed Task Queue
//!
//! A Redis-backed distributed task queue with:
//! - Named jobs with opaque framed payloads
//! - Priority and routing-key aware dequeue via blocking pops
//! - At-least-once delivery with exponential-backoff retries
//! - Delayed execution and a dead-letter queue
//! - A result backend with pub/sub notified blocking waits
//! - Cron schedules with IANA timezones and a distributed single-fire lock
//! - Configurable worker pools with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//!  Client ──submit──▶ Queue engine ──▶ route:{rk}:queue:{priority} lists
//!                          │                      │
//!                          │                 blocking pop
//!     queue:scheduled ◀────┤                      ▼
//!       (delayed set)      │              Worker pool ──▶ Executor ──▶ Handler
//!            │             │                      │
//!       promotion loop ────┘           complete / fail / retry
//!                                                 │
//!  Cron scheduler ──lock──▶ submit        Result backend ──▶ result:{id}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bananas::{Bananas, BananasConfig, Job, codec};
//! use serde_json::json;
//!
//! let runtime = Bananas::connect(BananasConfig::default()).await?;
//!
//! runtime.handlers().register("send_email", |ctx, job| async move {
//!     let request: EmailRequest = codec::decode_json(&job.payload)?;
//!     // deliver the email, observing ctx.cancel for shutdown
//!     Ok(None)
//! });
//!
//! runtime.start()?;
//!
//! let payload = codec::encode_json(&json!({"to": "user@example.com"}))?;
//! let id = runtime.submit(Job::new("send_email", payload)).await?;
//! let result = runtime.wait_for_result(&id, Duration::from_secs(30)).await?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod keys;
pub mod maintenance;
pub mod metrics;
pub mod queue;
pub mod result;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::{BananasConfig, QueueConfig, ResultConfig, SchedulerConfig, StoreConfig, WorkerConfig, WorkerMode};
pub use error::{BananasError, BananasResult};
pub use executor::{CancelToken, Executor, HandlerRegistry, JobContext};
pub use job::{Job, JobId, JobStatus, Priority, DEFAULT_ROUTING_KEY};
pub use keys::Keys;
pub use queue::{Queue, ReadySources};
pub use result::{JobResult, ResultBackend, ResultStatus};
pub use runtime::Bananas;
pub use scheduler::{CronScheduler, Schedule, ScheduleRegistry, ScheduleState};
pub use store::{MemoryStore, RedisStore, Store, StoreOp, Subscription};
pub use worker::WorkerPool;

/// Commonly used types.
pub mod prelude {
    pub use crate::config::{BananasConfig, WorkerMode};
    pub use crate::error::{BananasError, BananasResult};
    pub use crate::executor::{HandlerRegistry, JobContext};
    pub use crate::job::{Job, JobId, JobStatus, Priority};
    pub use crate::runtime::Bananas;
    pub use crate::scheduler::Schedule;
    pub use crate::store::Store;
}
