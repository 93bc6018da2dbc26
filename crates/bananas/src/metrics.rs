//! Metrics for queue monitoring.
//!
//! Uses the `metrics` facade; wiring an exporter is the embedding
//! process's concern.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "bananas_jobs_enqueued_total";
    /// Total jobs dequeued for processing.
    pub const JOBS_DEQUEUED_TOTAL: &str = "bananas_jobs_dequeued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "bananas_jobs_completed_total";
    /// Total job executions that failed.
    pub const JOBS_FAILED_TOTAL: &str = "bananas_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "bananas_jobs_retried_total";
    /// Total jobs moved to the dead-letter queue.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "bananas_jobs_dead_lettered_total";
    /// Total jobs promoted from the delayed set to ready queues.
    pub const JOBS_PROMOTED_TOTAL: &str = "bananas_jobs_promoted_total";
    /// Total stuck jobs requeued by the reaper.
    pub const JOBS_REAPED_TOTAL: &str = "bananas_jobs_reaped_total";
    /// Total orphaned ids routed to the dead-letter queue at dequeue.
    pub const JOBS_ORPHANED_TOTAL: &str = "bananas_jobs_orphaned_total";

    /// Total store errors observed by workers.
    pub const STORE_ERRORS_TOTAL: &str = "bananas_store_errors_total";

    /// Total periodic schedules fired.
    pub const SCHEDULES_FIRED_TOTAL: &str = "bananas_schedules_fired_total";
    /// Total schedule lock acquisitions lost to another instance.
    pub const SCHEDULE_LOCK_CONTENTION_TOTAL: &str = "bananas_schedule_lock_contention_total";

    /// Active worker tasks.
    pub const WORKERS_ACTIVE: &str = "bananas_workers_active";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "bananas_job_duration_seconds";
}

/// Registers descriptions for all metrics.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEQUEUED_TOTAL,
        "Total number of jobs dequeued for processing"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of failed job executions"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the dead-letter queue"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of jobs promoted from the delayed set"
    );
    describe_counter!(
        names::JOBS_REAPED_TOTAL,
        "Total number of stuck jobs requeued by the reaper"
    );
    describe_counter!(
        names::JOBS_ORPHANED_TOTAL,
        "Total number of orphaned ids found at dequeue"
    );
    describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Total number of store errors observed by workers"
    );
    describe_counter!(
        names::SCHEDULES_FIRED_TOTAL,
        "Total number of periodic schedules fired"
    );
    describe_counter!(
        names::SCHEDULE_LOCK_CONTENTION_TOTAL,
        "Total number of schedule fires skipped due to lock contention"
    );
    describe_gauge!(names::WORKERS_ACTIVE, "Number of active worker tasks");
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
}
