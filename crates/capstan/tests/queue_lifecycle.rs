//! End-to-end lifecycle behavior over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan::{
    Error, JobContext, JobEvent, JobOptions, JobStatus, Queue, ShutdownOptions, Worker,
    WorkerConfig,
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

async fn wait_for_status(
    queue: &Queue<MemoryStore>,
    job_id: uuid::Uuid,
    status: JobStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let job = queue.get_job_by_id(job_id).await.unwrap().unwrap();
        if job.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn echo_job_runs_to_completion_with_exactly_one_event_pair() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("echo", |payload, _ctx| async move { Ok(payload) });

    let created = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(Mutex::new(Vec::new()));
    {
        let created = created.clone();
        queue.on_job_created(move |_| {
            created.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let completed = completed.clone();
        queue.on_job_completed(move |event| {
            if let JobEvent::Completed { result_key, .. } = event {
                completed.lock().unwrap().push(result_key.clone());
            }
        });
    }

    let job = queue
        .add_job(
            "echo",
            json!({ "msg": "hi" }),
            JobOptions::default().with_max_attempts(1),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();

    assert!(wait_for_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(2)).await);
    worker.stop().await;

    let finished = queue.get_job_by_id(job.id).await.unwrap().unwrap();
    let result_key = finished.result_key.expect("completed job has a result key");
    assert!(finished.completed_at.is_some());
    assert!(finished.worker_id.is_none());

    // The stored result equals the handler's return value.
    let result = queue.get_job_result(&result_key).await.unwrap();
    assert_eq!(result, Some(json!({ "msg": "hi" })));

    let completed = completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0], result_key);
}

#[tokio::test]
async fn unknown_task_is_rejected_without_state_mutation() {
    let queue = Queue::new(MemoryStore::new());
    queue.init().await.unwrap();

    let err = queue
        .add_job("nope", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTask(name) if name == "nope"));

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
async fn progress_reports_are_monotone_and_emitted() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("steps", |_payload, ctx: JobContext| async move {
        ctx.update_progress(30).await?;
        ctx.update_progress(60).await?;
        // A stale lower report must not move the needle backwards.
        ctx.update_progress(10).await?;
        ctx.update_progress(90).await?;
        Ok(json!(null))
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        queue.on_job_progress(move |event| {
            if let JobEvent::Progress { progress, .. } = event {
                seen.lock().unwrap().push(*progress);
            }
        });
    }

    let job = queue
        .add_job("steps", json!({}), JobOptions::default())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();
    assert!(wait_for_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(2)).await);
    worker.stop().await;

    assert_eq!(*seen.lock().unwrap(), vec![30, 60, 90]);
    let finished = queue.get_job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(finished.progress, 90);
}

#[tokio::test]
async fn handler_stored_result_wins_over_return_value() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("explicit", |_payload, ctx: JobContext| async move {
        ctx.store_result(json!({ "explicit": true })).await?;
        Ok(json!({ "ignored": true }))
    });

    let job = queue
        .add_job("explicit", json!({}), JobOptions::default())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();
    assert!(wait_for_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(2)).await);
    worker.stop().await;

    let finished = queue.get_job_by_id(job.id).await.unwrap().unwrap();
    let result = queue
        .get_job_result(&finished.result_key.unwrap())
        .await
        .unwrap();
    assert_eq!(result, Some(json!({ "explicit": true })));
}

#[tokio::test]
async fn detailed_info_resolves_result_after_completion() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("echo", |payload, _ctx| async move { Ok(payload) });

    let job = queue
        .add_job("echo", json!({ "n": 7 }), JobOptions::default())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(Arc::clone(&queue), fast_worker()));
    worker.start();
    assert!(wait_for_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(2)).await);
    worker.stop().await;

    let info = queue.get_detailed_job_info(job.id).await.unwrap().unwrap();
    assert_eq!(info.job.status, JobStatus::Completed);
    assert_eq!(info.result, Some(json!({ "n": 7 })));
}

#[tokio::test]
async fn shutdown_refuses_new_admissions() {
    let queue = Queue::new(MemoryStore::new());
    queue.init().await.unwrap();
    queue.register_task("echo", |payload, _ctx| async move { Ok(payload) });

    queue.shutdown(ShutdownOptions::default()).await.unwrap();
    assert!(queue.is_shutting_down());

    let err = queue
        .add_job("echo", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}
