//! End-to-end flows over the in-memory store: submit, execute, retry,
//! dead-letter, and result retrieval through the assembled runtime.

use bananas::codec;
use bananas::prelude::*;
use bananas::result::ResultStatus;
use bananas::store::MemoryStore;
use bananas::Bananas;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn runtime_config() -> BananasConfig {
    let mut config = BananasConfig::default();
    config.worker.mode = WorkerMode::Thin;
    config.worker.concurrency = 2;
    config.worker.block_timeout_secs = 1;
    config.scheduler.promotion_interval_ms = 50;
    config.scheduler.cron_enabled = false;
    config.validate().unwrap();
    config
}

fn runtime() -> (Arc<MemoryStore>, Bananas) {
    let store = Arc::new(MemoryStore::new());
    let runtime = Bananas::with_store(runtime_config(), store.clone());
    (store, runtime)
}

#[tokio::test]
async fn echo_job_completes_with_result() {
    let (store, runtime) = runtime();
    runtime
        .handlers()
        .register("echo", |_ctx, job: Job| async move {
            Ok(Some(job.payload.clone()))
        });
    runtime.start().unwrap();

    let payload = codec::encode_json(&json!({"x": 1})).unwrap();
    let id = runtime
        .submit(Job::new("echo", payload.clone()))
        .await
        .unwrap();

    let result = runtime
        .wait_for_result(&id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(result.result.as_deref(), Some(payload.as_slice()));
    assert_eq!(result.error, None);

    let job = runtime.queue().get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // The id has left both the ready queue and the processing list.
    assert_eq!(
        store
            .llen("bananas:route:default:queue:normal")
            .await
            .unwrap(),
        0
    );
    assert_eq!(store.llen("bananas:queue:processing").await.unwrap(), 0);

    runtime.stop().await;
}

#[tokio::test]
async fn flaky_job_retries_then_succeeds() {
    let (store, runtime) = runtime();

    // Fails on the first two executions, succeeds on the third.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    runtime.handlers().register("flaky", move |_ctx, _job| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BananasError::Handler("transient".to_string()))
            } else {
                Ok(None)
            }
        }
    });
    runtime.start().unwrap();

    let id = runtime
        .submit(Job::new("flaky", Vec::new()).with_max_retries(3))
        .await
        .unwrap();

    // Two backoffs of 2s and 4s before the successful run.
    let result = runtime
        .wait_for_result(&id, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let job = runtime.queue().get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    // Nothing left in the delayed set or the DLQ.
    assert_eq!(store.zcard("bananas:queue:scheduled").await.unwrap(), 0);
    assert_eq!(runtime.queue().dead_letter_len().await.unwrap(), 0);

    runtime.stop().await;
}

#[tokio::test]
async fn exhausted_job_lands_in_dead_letter_queue() {
    let (store, runtime) = runtime();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    runtime.handlers().register("always_fail", move |_ctx, _job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BananasError::Handler("permanent".to_string()))
        }
    });
    runtime.start().unwrap();

    let id = runtime
        .submit(Job::new("always_fail", Vec::new()).with_max_retries(2))
        .await
        .unwrap();

    // max_retries + 1 total executions, then terminal failure.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = runtime.queue().get_job(&id).await.unwrap().unwrap();
        if job.status == JobStatus::Failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never reached the dead-letter queue"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = store.lrange("bananas:queue:dead", 0, -1).await.unwrap();
    assert_eq!(dead, vec![id.to_string()]);

    let result = runtime
        .wait_for_result(&id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("handler failed: permanent"));

    runtime.stop().await;
}

#[tokio::test]
async fn waiter_blocked_before_completion_is_notified() {
    let (_store, runtime) = runtime();
    runtime.handlers().register("slowish", |_ctx, _job| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Some(b"done".to_vec()))
    });
    runtime.start().unwrap();

    let id = runtime
        .submit(Job::new("slowish", Vec::new()))
        .await
        .unwrap();

    // The wait starts while the job is still running.
    let result = runtime
        .wait_for_result(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.result.as_deref(), Some(b"done".as_slice()));

    runtime.stop().await;
}
