//! Concurrent claim partitioning and shutdown single-flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan::{
    JobEvent, JobOptions, JobStatus, Queue, ShutdownOptions, StorageAdapter, Worker, WorkerConfig,
};
use capstan_memory::MemoryStore;
use serde_json::json;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_workers_never_claim_the_same_job() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("work", |payload, _ctx| async move { Ok(payload) });

    for i in 0..100 {
        queue
            .add_job("work", json!({ "n": i }), JobOptions::default())
            .await
            .unwrap();
    }

    let mut claimers = Vec::new();
    for w in 0..4 {
        let store = queue.store();
        claimers.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let tasks = vec!["work".to_string()];
            let mut mine = Vec::new();
            loop {
                match store.fetch_next_job(&worker_id, &tasks).await.unwrap() {
                    Some(job) => {
                        mine.push(job.id);
                        store.complete_job(job.id, None).await.unwrap();
                    }
                    None => break,
                }
            }
            mine
        }));
    }

    let mut all: Vec<Uuid> = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }

    let distinct: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 100, "every job processed exactly once");
    assert_eq!(distinct.len(), 100, "no job claimed twice");

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 100);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_live_workers_complete_every_job_exactly_once() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();

    // Handlers jitter their runtime so claims interleave unpredictably.
    queue.register_task("jittery", |payload, _ctx| async move {
        let pause = fastrand::u64(1..15);
        tokio::time::sleep(Duration::from_millis(pause)).await;
        Ok(payload)
    });

    let completions = Arc::new(Mutex::new(Vec::new()));
    {
        let completions = completions.clone();
        queue.on_job_completed(move |event| {
            if let JobEvent::Completed { job_id, .. } = event {
                completions.lock().unwrap().push(*job_id);
            }
        });
    }

    let mut ids = HashSet::new();
    for _ in 0..30 {
        let priority = fastrand::i32(0..5);
        let job = queue
            .add_job(
                "jittery",
                json!({}),
                JobOptions::default().with_priority(priority),
            )
            .await
            .unwrap();
        ids.insert(job.id);
    }

    let config = WorkerConfig {
        poll_interval: Duration::from_millis(10),
        max_execution_time: None,
        batch_size: 5,
    };
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let worker = Arc::new(Worker::new(Arc::clone(&queue), config.clone()));
            worker.start();
            worker
        })
        .collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let stats = queue.get_queue_stats().await.unwrap();
        if stats.completed == 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    for worker in &workers {
        worker.stop().await;
    }

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 30, "one completion event per job");
    let distinct: HashSet<Uuid> = completions.iter().copied().collect();
    assert_eq!(distinct, ids);
}

#[tokio::test]
async fn single_worker_claims_in_priority_then_age_order() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("ordered", |payload, _ctx| async move { Ok(payload) });

    let low_old = queue
        .add_job("ordered", json!({}), JobOptions::default().with_priority(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let low_new = queue
        .add_job("ordered", json!({}), JobOptions::default().with_priority(1))
        .await
        .unwrap();
    let high = queue
        .add_job("ordered", json!({}), JobOptions::default().with_priority(5))
        .await
        .unwrap();

    let store = queue.store();
    let tasks = vec!["ordered".to_string()];
    let mut order = Vec::new();
    while let Some(job) = store.fetch_next_job("w", &tasks).await.unwrap() {
        order.push(job.id);
        store.complete_job(job.id, None).await.unwrap();
    }

    assert_eq!(order, vec![high.id, low_old.id, low_new.id]);
}

#[tokio::test]
async fn concurrent_shutdowns_share_one_outcome() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("echo", |payload, _ctx| async move { Ok(payload) });

    let a = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.shutdown(ShutdownOptions::default()).await })
    };
    let b = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.shutdown(ShutdownOptions::default()).await })
    };

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert!(queue.is_shutting_down());

    // And a third, later call still reports the same completed outcome.
    assert!(queue.shutdown(ShutdownOptions::default()).await.is_ok());
}

#[tokio::test]
async fn batch_claims_partition_without_overlap() {
    let queue = Arc::new(Queue::new(MemoryStore::new()));
    queue.init().await.unwrap();
    queue.register_task("work", |payload, _ctx| async move { Ok(payload) });

    for _ in 0..20 {
        queue
            .add_job("work", json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    let store = queue.store();
    let tasks = vec!["work".to_string()];
    let a = store.fetch_next_batch("worker-a", &tasks, 8).await.unwrap();
    let b = store.fetch_next_batch("worker-b", &tasks, 8).await.unwrap();

    assert_eq!(a.len(), 8);
    assert_eq!(b.len(), 8);
    let ids_a: HashSet<Uuid> = a.iter().map(|j| j.id).collect();
    let ids_b: HashSet<Uuid> = b.iter().map(|j| j.id).collect();
    assert!(ids_a.is_disjoint(&ids_b));

    for job in a.iter().chain(b.iter()) {
        assert_eq!(job.status, JobStatus::Running);
    }
}
