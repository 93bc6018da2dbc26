//! Periodic task scheduler.
//!
//! Schedules are 5-field cron expressions evaluated in an IANA timezone.
//! Any number of scheduler instances may run against the same store; a
//! per-schedule lock with a unique token guarantees each fire instant is
//! enqueued exactly once, and release is a token-checked compare-and-delete
//! so an expired holder can never release a lock someone else now owns.

use crate::error::{BananasError, BananasResult};
use crate::job::{Job, Priority};
use crate::keys::Keys;
use crate::metrics::names;
use crate::queue::Queue;
use crate::store::Store;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A recurring job definition.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Unique schedule id, `[A-Za-z0-9_-]+`.
    pub id: String,
    /// The 5-field cron expression as given.
    pub cron: String,
    /// Handler name for the submitted jobs.
    pub job_name: String,
    /// Framed payload submitted with each fire.
    pub payload: Vec<u8>,
    /// Priority of the submitted jobs.
    pub priority: Priority,
    /// Routing key of the submitted jobs.
    pub routing_key: String,
    /// Timezone the cron expression is evaluated in.
    pub timezone: Tz,
    /// Disabled schedules are skipped by the ticker.
    pub enabled: bool,
    /// Free text.
    pub description: String,

    parsed: CronSchedule,
}

impl Schedule {
    /// Creates a schedule with defaults: UTC, normal priority, the default
    /// routing key, enabled.
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        job_name: impl Into<String>,
    ) -> BananasResult<Self> {
        let id = id.into();
        let cron = cron.into();

        validate_schedule_id(&id)?;
        let parsed = parse_cron(&cron)?;

        Ok(Self {
            id,
            cron,
            job_name: job_name.into(),
            payload: Vec::new(),
            priority: Priority::Normal,
            routing_key: crate::job::DEFAULT_ROUTING_KEY.to_string(),
            timezone: chrono_tz::UTC,
            enabled: true,
            description: String::new(),
            parsed,
        })
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the routing key.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Sets the timezone from an IANA zone name.
    pub fn with_timezone(mut self, zone: &str) -> BananasResult<Self> {
        self.timezone = Tz::from_str(zone)
            .map_err(|_| BananasError::InvalidTimezone(zone.to_string()))?;
        Ok(self)
    }

    /// Enables or disables the schedule.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// First fire instant strictly after `after`, evaluated in the
    /// schedule's timezone. Daylight-saving transitions follow the zone's
    /// rules; `None` if the expression never fires again.
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.parsed
            .after(&local)
            .next()
            .map(|fire| fire.with_timezone(&Utc))
    }

    /// Builds the job submitted for a fire at `fire_time`.
    pub fn build_job(&self, fire_time: DateTime<Utc>) -> Job {
        Job::new(self.job_name.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_routing_key(self.routing_key.clone())
            .with_description(format!(
                "schedule:{}@{}",
                self.id,
                fire_time.to_rfc3339_opts(SecondsFormat::Secs, true)
            ))
    }
}

/// Validates a schedule id: non-empty, `[A-Za-z0-9_-]` only.
pub fn validate_schedule_id(id: &str) -> BananasResult<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BananasError::InvalidScheduleId(id.to_string()));
    }
    Ok(())
}

/// Parses a strict 5-field cron expression (minute, hour, day-of-month,
/// month, day-of-week).
fn parse_cron(expression: &str) -> BananasResult<CronSchedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(BananasError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, found {}", fields.len()),
        });
    }

    // The cron crate wants a leading seconds field; pin it to zero.
    let with_seconds = format!("0 {}", fields.join(" "));
    CronSchedule::from_str(&with_seconds).map_err(|e| BananasError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// In-memory registry of schedules, keyed by id.
#[derive(Default)]
pub struct ScheduleRegistry {
    schedules: RwLock<HashMap<String, Arc<Schedule>>>,
}

impl ScheduleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schedule; refuses duplicates.
    pub fn register(&self, schedule: Schedule) -> BananasResult<()> {
        let mut schedules = self.schedules.write();
        if schedules.contains_key(&schedule.id) {
            return Err(BananasError::Scheduler(format!(
                "duplicate schedule id {:?}",
                schedule.id
            )));
        }
        info!(schedule_id = %schedule.id, cron = %schedule.cron, "registered schedule");
        schedules.insert(schedule.id.clone(), Arc::new(schedule));
        Ok(())
    }

    /// Like [`register`](Self::register) but aborts the process on error.
    /// For static schedules known at startup.
    pub fn must_register(&self, schedule: Schedule) {
        if let Err(e) = self.register(schedule) {
            panic!("schedule registration failed: {}", e);
        }
    }

    /// Removes a schedule.
    pub fn unregister(&self, id: &str) -> Option<Arc<Schedule>> {
        self.schedules.write().remove(id)
    }

    /// Snapshot of all registered schedules.
    pub fn snapshot(&self) -> Vec<Arc<Schedule>> {
        self.schedules.read().values().cloned().collect()
    }

    /// Number of registered schedules.
    pub fn len(&self) -> usize {
        self.schedules.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.schedules.read().is_empty()
    }
}

/// Persistent per-schedule execution state, stored as a hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleState {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: String,
}

impl ScheduleState {
    fn parse_ts(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Decodes state from hash fields; absent fields default.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            last_run: Self::parse_ts(fields, "last_run"),
            next_run: Self::parse_ts(fields, "next_run"),
            run_count: fields
                .get("run_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_success: Self::parse_ts(fields, "last_success"),
            last_error: fields.get("last_error").cloned().unwrap_or_default(),
        }
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Distributed cron scheduler.
///
/// Ticks at a configured interval; each due schedule is fired under a
/// store-backed lock so concurrent instances cooperate instead of
/// double-enqueueing. Lock contention is the expected case in a multi-node
/// deployment and is not an error.
pub struct CronScheduler {
    id: String,
    store: Arc<dyn Store>,
    queue: Arc<Queue>,
    registry: Arc<ScheduleRegistry>,
    keys: Keys,
    lock_ttl_secs: u64,
}

impl CronScheduler {
    /// Creates a scheduler instance.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<Queue>,
        registry: Arc<ScheduleRegistry>,
        keys: Keys,
        lock_ttl_secs: u64,
    ) -> Self {
        Self {
            id: format!("cron-{}", Uuid::new_v4()),
            store,
            queue,
            registry,
            keys,
            lock_ttl_secs,
        }
    }

    /// Scheduler instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reads a schedule's persisted state.
    pub async fn read_state(&self, schedule_id: &str) -> BananasResult<ScheduleState> {
        let fields = self
            .store
            .hgetall(&self.keys.schedule_state(schedule_id))
            .await?;
        Ok(ScheduleState::from_fields(&fields))
    }

    /// Evaluates every enabled schedule once. Returns the number of jobs
    /// enqueued by this instance.
    pub async fn tick(&self) -> BananasResult<u64> {
        let now = Utc::now();
        let mut fired = 0u64;

        for schedule in self.registry.snapshot() {
            if !schedule.enabled {
                continue;
            }
            match self.evaluate(&schedule, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "schedule evaluation failed");
                }
            }
        }

        Ok(fired)
    }

    /// Evaluates one schedule at `now`. Returns whether this instance
    /// enqueued a job.
    async fn evaluate(&self, schedule: &Schedule, now: DateTime<Utc>) -> BananasResult<bool> {
        let state_key = self.keys.schedule_state(&schedule.id);
        let state = self.read_state(&schedule.id).await?;

        let due_at = match state.next_run {
            Some(next_run) => next_run,
            None => {
                // Never evaluated before: persist the first fire time and
                // wait for it to arrive.
                let Some(first) = schedule.next_run(now) else {
                    return Ok(false);
                };
                self.store
                    .hset_multiple(
                        &state_key,
                        &[("next_run".to_string(), fmt_ts(first))],
                    )
                    .await?;
                return Ok(false);
            }
        };

        if now < due_at {
            return Ok(false);
        }

        // One instance per fire: the lock token is unique to this attempt.
        let lock_key = self.keys.schedule_lock(&schedule.id);
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_nx_ex(&lock_key, &token, self.lock_ttl_secs)
            .await?
        {
            counter!(names::SCHEDULE_LOCK_CONTENTION_TOTAL).increment(1);
            debug!(schedule_id = %schedule.id, "schedule locked by another instance");
            return Ok(false);
        }

        // Another instance may have fired between our state read and the
        // lock acquisition; re-check under the lock.
        let state = self.read_state(&schedule.id).await?;
        if state.next_run != Some(due_at) {
            if let Err(e) = self.store.compare_and_delete(&lock_key, &token).await {
                warn!(schedule_id = %schedule.id, error = %e, "failed to release schedule lock");
            }
            return Ok(false);
        }

        let fired = self.fire(schedule, &state_key, due_at, now).await;

        // Token-checked release: never deletes a lock re-acquired by
        // someone else after our TTL expired.
        if let Err(e) = self.store.compare_and_delete(&lock_key, &token).await {
            warn!(schedule_id = %schedule.id, error = %e, "failed to release schedule lock");
        }

        fired
    }

    async fn fire(
        &self,
        schedule: &Schedule,
        state_key: &str,
        fire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BananasResult<bool> {
        let job = schedule.build_job(fire_time);
        let next = schedule.next_run(now);

        let mut fields = vec![("last_run".to_string(), fmt_ts(now))];
        match next {
            Some(next) => fields.push(("next_run".to_string(), fmt_ts(next))),
            // Expression never fires again; clear the field so the
            // schedule is not considered due on later ticks.
            None => fields.push(("next_run".to_string(), String::new())),
        }

        match self.queue.enqueue(job).await {
            Ok(job_id) => {
                fields.push(("last_success".to_string(), fmt_ts(now)));
                fields.push(("last_error".to_string(), String::new()));
                self.store.hset_multiple(state_key, &fields).await?;
                self.store.hincrby(state_key, "run_count", 1).await?;

                counter!(names::SCHEDULES_FIRED_TOTAL).increment(1);
                info!(
                    schedule_id = %schedule.id,
                    job_id = %job_id,
                    fire_time = %fire_time,
                    "fired schedule"
                );
                Ok(true)
            }
            Err(e) => {
                fields.push(("last_error".to_string(), e.to_string()));
                self.store.hset_multiple(state_key, &fields).await?;
                self.store.hincrby(state_key, "run_count", 1).await?;

                error!(schedule_id = %schedule.id, error = %e, "failed to enqueue scheduled job");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::JobStatus;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_required() {
        assert!(Schedule::new("ok", "*/5 * * * *", "tick").is_ok());

        // Six fields (a seconds field) are refused.
        let err = Schedule::new("bad", "0 */5 * * * *", "tick").unwrap_err();
        assert!(matches!(err, BananasError::InvalidCronExpression { .. }));

        let err = Schedule::new("bad", "* * * *", "tick").unwrap_err();
        assert!(matches!(err, BananasError::InvalidCronExpression { .. }));

        let err = Schedule::new("bad", "99 * * * *", "tick").unwrap_err();
        assert!(matches!(err, BananasError::InvalidCronExpression { .. }));
    }

    #[test]
    fn schedule_id_format() {
        assert!(validate_schedule_id("nightly-report_2").is_ok());
        assert!(validate_schedule_id("").is_err());
        assert!(validate_schedule_id("has space").is_err());
        assert!(validate_schedule_id("slash/id").is_err());
    }

    #[test]
    fn invalid_timezone_refused() {
        let err = Schedule::new("s", "0 9 * * *", "tick")
            .unwrap()
            .with_timezone("Mars/Olympus_Mons")
            .unwrap_err();
        assert!(matches!(err, BananasError::InvalidTimezone(_)));
    }

    #[test]
    fn next_run_is_strictly_after() {
        let schedule = Schedule::new("s", "0 * * * *", "tick").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();

        let next = schedule.next_run(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_run_across_spring_forward() {
        // First instant after the US spring-forward transition of 2025.
        let schedule = Schedule::new("s", "0 9 * * *", "daily")
            .unwrap()
            .with_timezone("America/New_York")
            .unwrap();

        let after = Utc.with_ymd_and_hms(2025, 3, 9, 11, 0, 0).unwrap(); // 07:00 EDT
        let next = schedule.next_run(after).unwrap();

        // 09:00 EDT == 13:00 UTC.
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 9, 13, 0, 0).unwrap());
    }

    #[test]
    fn registry_refuses_duplicates() {
        let registry = ScheduleRegistry::new();
        registry
            .register(Schedule::new("s1", "* * * * *", "tick").unwrap())
            .unwrap();

        let err = registry
            .register(Schedule::new("s1", "* * * * *", "tock").unwrap())
            .unwrap_err();
        assert!(matches!(err, BananasError::Scheduler(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn state_round_trip_through_fields() {
        let mut fields = HashMap::new();
        fields.insert("last_run".to_string(), "2025-06-01T09:00:00.000Z".to_string());
        fields.insert("next_run".to_string(), "2025-06-01T10:00:00.000Z".to_string());
        fields.insert("run_count".to_string(), "17".to_string());
        fields.insert("last_error".to_string(), "".to_string());

        let state = ScheduleState::from_fields(&fields);
        assert_eq!(state.run_count, 17);
        assert_eq!(
            state.last_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())
        );
        assert!(state.last_error.is_empty());
        assert_eq!(state.last_success, None);
    }

    fn scheduler_fixture() -> (Arc<MemoryStore>, Arc<Queue>, Arc<ScheduleRegistry>, CronScheduler) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let keys = Keys::new("bananas");
        let queue = Arc::new(Queue::new(
            store.clone(),
            keys.clone(),
            QueueConfig::default(),
        ));
        let registry = Arc::new(ScheduleRegistry::new());
        let scheduler = CronScheduler::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            keys,
            60,
        );
        (store, queue, registry, scheduler)
    }

    /// Forces a schedule to be due by backdating its persisted next_run.
    async fn backdate(store: &MemoryStore, schedule_id: &str) {
        let key = format!("bananas:schedules:{}", schedule_id);
        store
            .hset_multiple(
                &key,
                &[(
                    "next_run".to_string(),
                    fmt_ts(Utc::now() - chrono::Duration::seconds(30)),
                )],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_tick_initializes_state_without_firing() {
        let (_store, queue, registry, scheduler) = scheduler_fixture();
        registry
            .register(Schedule::new("hourly", "0 * * * *", "tick").unwrap())
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 0);

        let state = scheduler.read_state("hourly").await.unwrap();
        assert!(state.next_run.is_some());
        assert_eq!(state.run_count, 0);
        assert_eq!(
            queue
                .queue_depth("default", Priority::Normal)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn due_schedule_fires_once_and_advances() {
        let (store, queue, registry, scheduler) = scheduler_fixture();
        registry
            .register(Schedule::new("minutely", "* * * * *", "tick").unwrap())
            .unwrap();

        backdate(&store, "minutely").await;
        assert_eq!(scheduler.tick().await.unwrap(), 1);

        let state = scheduler.read_state("minutely").await.unwrap();
        assert_eq!(state.run_count, 1);
        assert!(state.last_run.is_some());
        assert!(state.last_success.is_some());
        assert!(state.next_run.unwrap() > Utc::now());

        // The enqueued job carries the schedule attribution.
        assert_eq!(
            queue
                .queue_depth("default", Priority::Normal)
                .await
                .unwrap(),
            1
        );

        // Re-ticking immediately does not double-fire.
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_schedules_are_skipped() {
        let (store, _queue, registry, scheduler) = scheduler_fixture();
        registry
            .register(
                Schedule::new("off", "* * * * *", "tick")
                    .unwrap()
                    .with_enabled(false),
            )
            .unwrap();

        backdate(&store, "off").await;
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_instances_fire_exactly_once() {
        let (store, queue, registry, scheduler_a) = scheduler_fixture();
        let scheduler_b = CronScheduler::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            Keys::new("bananas"),
            60,
        );

        registry
            .register(Schedule::new("shared", "* * * * *", "tick").unwrap())
            .unwrap();
        backdate(&store, "shared").await;

        let (fired_a, fired_b) = tokio::join!(scheduler_a.tick(), scheduler_b.tick());
        let total = fired_a.unwrap() + fired_b.unwrap();
        assert_eq!(total, 1, "exactly one instance must fire");

        assert_eq!(
            queue
                .queue_depth("default", Priority::Normal)
                .await
                .unwrap(),
            1
        );

        let state = scheduler_a.read_state("shared").await.unwrap();
        assert_eq!(state.run_count, 1);
    }

    #[tokio::test]
    async fn fired_job_matches_schedule() {
        let (store, queue, registry, scheduler) = scheduler_fixture();
        let payload = crate::codec::encode_json(&serde_json::json!({"report": "daily"})).unwrap();
        registry
            .register(
                Schedule::new("report", "* * * * *", "build_report")
                    .unwrap()
                    .with_payload(payload.clone())
                    .with_priority(Priority::High)
                    .with_routing_key("reports"),
            )
            .unwrap();

        backdate(&store, "report").await;
        scheduler.tick().await.unwrap();

        let ids = store
            .lrange("bananas:route:reports:queue:high", 0, -1)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let job = queue.get_job(&ids[0].as_str().into()).await.unwrap().unwrap();
        assert_eq!(job.name, "build_report");
        assert_eq!(job.payload, payload);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.description.starts_with("schedule:report@"));
    }
}
