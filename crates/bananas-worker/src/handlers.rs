//! Handler and schedule registration for this worker deployment.
//!
//! The stock binary ships two utility handlers so a fresh deployment can be
//! exercised end to end; real deployments replace these with their own job
//! types.

use bananas::executor::HandlerRegistry;
use bananas::scheduler::ScheduleRegistry;
use bananas::{codec, BananasError, Job, JobContext};
use tracing::{info, warn};

/// Registers this deployment's handlers.
pub fn install(registry: &HandlerRegistry) {
    // Returns its payload unchanged. Useful for smoke-testing a deployment.
    registry.register("echo", |_ctx: JobContext, job: Job| async move {
        Ok(Some(job.payload.clone()))
    });

    // Logs its payload at info level.
    registry.register("log", |_ctx: JobContext, job: Job| async move {
        match codec::decode_json::<serde_json::Value>(&job.payload) {
            Ok(value) => info!(job_id = %job.id, payload = %value, "log job"),
            Err(e) => return Err(BananasError::Handler(format!("undecodable payload: {}", e))),
        }
        Ok(None)
    });

    if registry.names().len() == 2 {
        warn!("only the stock handlers are registered; submitted jobs with other names will fail");
    }
}

/// Registers this deployment's periodic schedules. Empty by default.
pub fn install_schedules(_registry: &ScheduleRegistry) {}
