//! Batch-mode execution and the worker pool.

use std::sync::Arc;
use std::time::Duration;

use capstan::{
    JobFilter, JobOptions, JobStatus, PoolConfig, Queue, Worker, WorkerConfig, WorkerPool,
};
use capstan_memory::MemoryStore;
use serde_json::json;

fn batch_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(20),
        max_execution_time: Some(Duration::from_secs(5)),
        batch_size: 3,
    }
}

#[tokio::test]
async fn batch_run_drains_the_queue_within_budget() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("w", |payload, _ctx| async move { Ok(payload) });

    for _ in 0..7 {
        queue
            .add_job("w", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let worker = Worker::new(Arc::clone(&queue), batch_config());
    let processed = worker
        .process_next_batch(50, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(processed, 7);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 7);
    assert_eq!(stats.pending, 0);

    // A drained queue yields an empty run.
    let processed = worker
        .process_next_batch(50, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(processed, 0);
}

#[tokio::test]
async fn batch_run_respects_the_job_cap() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("w", |payload, _ctx| async move { Ok(payload) });

    for _ in 0..6 {
        queue
            .add_job("w", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let worker = Worker::new(Arc::clone(&queue), batch_config());
    let processed = worker
        .process_next_batch(2, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(processed, 2);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 4);
}

#[tokio::test]
async fn started_batch_worker_runs_once_and_stops() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("w", |payload, _ctx| async move { Ok(payload) });

    for _ in 0..4 {
        queue
            .add_job("w", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let worker = Arc::new(Worker::new(Arc::clone(&queue), batch_config()));
    worker.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let stats = queue.get_queue_stats().await.unwrap();
        if stats.completed == 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch worker should process all ready jobs"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_processes_jobs_and_drains_cleanly() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("w", |payload, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(payload)
    });

    for _ in 0..6 {
        queue
            .add_job("w", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 2,
            max_workers: 4,
            check_interval: Duration::from_millis(50),
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(15),
                max_execution_time: None,
                batch_size: 5,
            },
        },
    ));
    pool.start().await;
    assert_eq!(pool.worker_count().await, 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = queue.get_queue_stats().await.unwrap();
        if stats.completed == 6 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool should process every job"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    pool.shutdown().await;
    assert_eq!(pool.worker_count().await, 0);

    let completed = queue
        .list_jobs(&JobFilter::by_status(JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_scales_up_under_backlog() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    // Slow handler keeps the backlog deep while the controller observes it.
    queue.register_task("slow", |payload, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(payload)
    });

    for _ in 0..30 {
        queue
            .add_job("slow", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        PoolConfig {
            min_workers: 1,
            max_workers: 3,
            check_interval: Duration::from_millis(40),
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(15),
                max_execution_time: None,
                batch_size: 5,
            },
        },
    ));
    pool.start().await;

    // pending (≈30) > workers × 3, so the controller adds workers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while pool.worker_count().await < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "controller should scale up under backlog"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(pool.worker_count().await <= 3);

    pool.shutdown().await;
}
