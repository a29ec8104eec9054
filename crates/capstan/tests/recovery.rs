//! Retry backoff and stale-job recovery, end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan::{
    Error, JobEvent, JobOptions, JobStatus, Queue, StorageAdapter, Worker, WorkerConfig,
};
use capstan_memory::MemoryStore;
use serde_json::json;

fn fast_worker() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(30),
        max_execution_time: None,
        batch_size: 5,
    }
}

#[tokio::test]
async fn flaky_handler_retries_with_backoff_then_completes() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        queue.register_task("flaky", move |_payload, _ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::handler(anyhow::anyhow!("transient blip")))
                } else {
                    Ok(json!("recovered"))
                }
            }
        });
    }

    let retries = Arc::new(Mutex::new(Vec::new()));
    {
        let retries = retries.clone();
        queue.on_job_failed(move |event| {
            if let JobEvent::Failed { will_retry, .. } = event {
                retries.lock().unwrap().push(*will_retry);
            }
        });
    }

    let submitted_at = chrono::Utc::now();
    let job = queue
        .add_job("flaky", json!({}), JobOptions::default().with_max_attempts(3))
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();

    // First attempt fails immediately; the retry lands after ~2^1 seconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    let mut finished = None;
    while tokio::time::Instant::now() < deadline {
        let current = queue.get_job_by_id(job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Completed {
            finished = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.stop().await;

    let finished = finished.expect("job should complete after one retry");
    assert_eq!(finished.attempts_made, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*retries.lock().unwrap(), vec![true]);

    // Exponential backoff: completion cannot precede the 2 s retry delay.
    let elapsed = finished.completed_at.unwrap() - submitted_at;
    assert!(
        elapsed >= chrono::Duration::seconds(2),
        "completed after only {} ms",
        elapsed.num_milliseconds()
    );
    // The failure that triggered the retry is still visible on the record.
    assert_eq!(
        finished.last_error.as_deref(),
        Some("handler failed: transient blip")
    );
}

#[tokio::test]
async fn exhausted_attempts_are_terminal() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("doomed", |_payload, _ctx| async move {
        Err::<serde_json::Value, _>(Error::handler(anyhow::anyhow!("always broken")))
    });

    let job = queue
        .add_job("doomed", json!({}), JobOptions::default().with_max_attempts(1))
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = queue.get_job_by_id(job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Failed {
            assert_eq!(current.attempts_made, 1);
            assert!(current.completed_at.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "single-attempt job should fail terminally"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.stop().await;

    // No subsequent claim ever succeeds for a terminal job.
    let store = queue.store();
    let claimed = store
        .fetch_next_job("late-worker", &["doomed".to_string()])
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn abandoned_job_is_recovered_by_another_worker() {
    let store = MemoryStore::with_stale_threshold(Duration::from_millis(150));
    let queue = Arc::new(Queue::new(store));
    queue.init().await.unwrap();
    queue.register_task("durable", |_payload, _ctx| async move { Ok(json!("done")) });

    let job = queue
        .add_job("durable", json!({}), JobOptions::default())
        .await
        .unwrap();

    // Worker A claims and then halts without heartbeating (a crash).
    let claimed = queue
        .store()
        .fetch_next_job("worker-a", &["durable".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.attempts_made, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;

    // Worker B's loop sweeps the stale job and claims it.
    let worker_b = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker_b.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut finished = None;
    while tokio::time::Instant::now() < deadline {
        let current = queue.get_job_by_id(job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Completed {
            finished = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker_b.stop().await;

    let finished = finished.expect("job should complete exactly once via worker B");
    assert_eq!(finished.attempts_made, 2);
    assert!(finished.result_key.is_some());
}

#[tokio::test]
async fn crash_on_the_final_attempt_fails_the_job_terminally() {
    let store = MemoryStore::with_stale_threshold(Duration::from_millis(100));
    let queue = Arc::new(Queue::new(store));
    queue.init().await.unwrap();
    queue.register_task("fragile", |_payload, _ctx| async move { Ok(json!("unreached")) });

    let job = queue
        .add_job(
            "fragile",
            json!({}),
            JobOptions::default().with_max_attempts(1),
        )
        .await
        .unwrap();

    // The only allowed attempt is claimed, then the worker dies silently.
    let claimed = queue
        .store()
        .fetch_next_job("worker-a", &["fragile".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts_made, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The sweep must not park it as Pending: with the budget spent it
    // would be unclaimable forever. It fails terminally instead.
    assert_eq!(queue.store().cleanup_stale_jobs().await.unwrap(), 1);

    let failed = queue.get_job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts_made, 1);
    assert!(failed.completed_at.is_some());
    assert!(failed.worker_id.is_none());
    assert!(failed.last_error.as_deref().unwrap().contains("stale"));

    // No subsequent claim or sweep touches the terminal job.
    assert!(queue
        .store()
        .fetch_next_job("worker-b", &["fragile".to_string()])
        .await
        .unwrap()
        .is_none());
    assert_eq!(queue.store().cleanup_stale_jobs().await.unwrap(), 0);
}
