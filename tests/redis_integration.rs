//! Integration tests for the broker against a real Redis.
//!
//! These tests issue real Redis commands.
//! Run with: TASKMILL_TEST_REDIS_URL=redis://localhost:6379 \
//!     cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use taskmill::registry::{ExpiringRegistry, QueueRegistry, WorkerRegistry};
use taskmill::store::{Batch, Store};
use taskmill::task::{Task, TaskStatus};
use taskmill::worker::{TaskHandler, Worker};
use taskmill::{registry_maintenance, Queue, RegistryError, Settings, StoreError, WorkerError};

fn get_test_redis_url() -> String {
    std::env::var("TASKMILL_TEST_REDIS_URL")
        .expect("TASKMILL_TEST_REDIS_URL environment variable must be set for integration tests")
}

/// Each test runs under its own key prefix so tests never see each
/// other's state and need no teardown.
async fn create_test_store() -> (Store, Settings) {
    let prefix = format!("tmtest-{}", Uuid::new_v4());
    let url = get_test_redis_url();
    let store = Store::connect(&url, &prefix)
        .await
        .expect("Redis should be reachable");
    let settings = Settings::new(&url)
        .with_key_prefix(&prefix)
        .with_poll_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_secs(60));
    (store, settings)
}

struct AlwaysOk;

#[async_trait]
impl TaskHandler for AlwaysOk {
    async fn run(&self, _task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

struct SlowOk;

#[async_trait]
impl TaskHandler for SlowOk {
    async fn run(&self, _task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl TaskHandler for AlwaysFails {
    async fn run(&self, _task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("boom".into())
    }
}

async fn enqueue_task(store: &Store, queue: &str) -> String {
    let mut task = Task::new(json!({"n": 1}));
    Queue::new(queue)
        .enqueue(store, &mut task)
        .await
        .expect("enqueue should succeed");
    task.id
}

fn test_worker(store: &Store, settings: &Settings, queues: &[&str], name: &str) -> Worker {
    Worker::new(
        store.clone(),
        queues.iter().map(|q| q.to_string()).collect(),
        Arc::new(AlwaysOk),
        settings.clone(),
    )
    .with_name(name)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_fifo_dequeue_order() {
    let (store, settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;
    let t2 = enqueue_task(&store, "default").await;

    let worker = test_worker(&store, &settings, &["default"], "w-fifo");
    worker.register().await.expect("register should succeed");

    let first = worker.dequeue().await.expect("dequeue").expect("task available");
    assert_eq!(first.id, t1, "oldest enqueued task must be dequeued first");
    assert_eq!(first.status, TaskStatus::Running);
    assert!(first.started_at.is_some());

    // Simulate the first task completing so the slot is free again.
    let mut batch = Batch::new();
    batch.pipeline().del(store.keys().running_slot("w-fifo")).ignore();
    store.commit(batch).await.expect("commit");

    let second = worker.dequeue().await.expect("dequeue").expect("task available");
    assert_eq!(second.id, t2);
}

#[tokio::test]
#[ignore]
async fn test_queue_priority_order() {
    let (store, settings) = create_test_store().await;
    let low = enqueue_task(&store, "low").await;
    let high = enqueue_task(&store, "high").await;

    let worker = test_worker(&store, &settings, &["high", "low"], "w-prio");
    worker.register().await.expect("register");

    let first = worker.dequeue().await.expect("dequeue").expect("task");
    assert_eq!(first.id, high, "first-listed queue must drain first");

    let mut batch = Batch::new();
    batch.pipeline().del(store.keys().running_slot("w-prio")).ignore();
    store.commit(batch).await.expect("commit");

    let second = worker.dequeue().await.expect("dequeue").expect("task");
    assert_eq!(second.id, low);
}

#[tokio::test]
#[ignore]
async fn test_burst_worker_finishes_tasks() {
    let (store, settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;
    let t2 = enqueue_task(&store, "default").await;

    let worker = test_worker(&store, &settings, &["default"], "w-burst");
    worker.run(true).await.expect("burst run should drain and exit");

    let registry = WorkerRegistry::new(store.keys());
    assert!(
        registry.running_task_ids(&store).await.expect("scan").is_empty(),
        "no running slot may remain after completion"
    );
    assert!(
        registry.worker_ids(&store).await.expect("ids").is_empty(),
        "graceful shutdown must deregister the worker"
    );

    let finished = ExpiringRegistry::finished(store.keys());
    let mut ids = finished.task_ids(&store).await.expect("ids");
    ids.sort();
    let mut expected = vec![t1.clone(), t2.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    let record = Task::fetch(&store, &t1).await.expect("record exists");
    assert_eq!(record.status, TaskStatus::Finished);
    assert!(record.ended_at.is_some());
    assert_eq!(Queue::new("default").len(&store).await.expect("len"), 0);
}

#[tokio::test]
#[ignore]
async fn test_failed_task_goes_to_failed_registry() {
    let (store, settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;

    let worker = Worker::new(
        store.clone(),
        vec!["default".to_string()],
        Arc::new(AlwaysFails),
        settings.clone(),
    )
    .with_name("w-fail");
    worker.run(true).await.expect("burst run");

    let failed = ExpiringRegistry::failed(store.keys());
    assert_eq!(failed.task_ids(&store).await.expect("ids"), vec![t1.clone()]);

    let record = Task::fetch(&store, &t1).await.expect("record exists");
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("boom"));
}

#[tokio::test]
#[ignore]
async fn test_dead_worker_reclamation_requeues_at_front() {
    let (store, settings) = create_test_store().await;
    let running = enqueue_task(&store, "default").await;
    let pending = enqueue_task(&store, "default").await;

    let worker = test_worker(&store, &settings, &["default"], "w-dead");
    worker.register().await.expect("register");
    let claimed = worker.dequeue().await.expect("dequeue").expect("task");
    assert_eq!(claimed.id, running);

    // Backdate the heartbeat past the timeout instead of waiting it out.
    let registry = WorkerRegistry::new(store.keys());
    let now = store.server_time().await.expect("time");
    let stale = now - settings.heartbeat_timeout.as_secs_f64() - 1.0;
    let mut batch = Batch::new();
    registry.stage_add("w-dead", stale, &mut batch);
    store.commit(batch).await.expect("commit");

    let report = registry_maintenance(&store, &settings).await;
    assert_eq!(report.workers_reclaimed, 1);

    assert!(registry.worker_ids(&store).await.expect("ids").is_empty());
    assert!(registry
        .running_task_of(&store, "w-dead")
        .await
        .expect("slot read")
        .is_none());

    // Requeued task is delivered before the task that was already pending.
    let order = Queue::new("default").task_ids(&store).await.expect("ids");
    assert_eq!(order, vec![running.clone(), pending.clone()]);
    let record = Task::fetch(&store, &running).await.expect("record");
    assert_eq!(record.status, TaskStatus::Queued);

    // Re-running the sweep with no intervening heartbeats changes nothing.
    let report = registry_maintenance(&store, &settings).await;
    assert!(report.is_noop());
    assert_eq!(
        Queue::new("default").task_ids(&store).await.expect("ids"),
        vec![running, pending]
    );
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_after_reclamation_is_fatal() {
    let (store, settings) = create_test_store().await;
    let registry = WorkerRegistry::new(store.keys());

    // Never-registered id.
    let err = registry.heartbeat(&store, "w-ghost").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoSuchWorker(_)));

    // Registered, reclaimed, then heartbeating: same fatal condition.
    let worker = test_worker(&store, &settings, &["default"], "w-reclaimed");
    worker.register().await.expect("register");
    registry.heartbeat(&store, "w-reclaimed").await.expect("heartbeat while live");

    registry.declare_dead(&store, "w-reclaimed").await.expect("reclaim");
    let err = registry.heartbeat(&store, "w-reclaimed").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoSuchWorker(_)));
}

#[tokio::test]
#[ignore]
async fn test_outcome_after_reclamation_is_discarded() {
    let (store, settings) = create_test_store().await;
    let t = enqueue_task(&store, "default").await;

    let worker = Worker::new(
        store.clone(),
        vec!["default".to_string()],
        Arc::new(SlowOk),
        settings.clone(),
    )
    .with_name("w-slow");
    let run = tokio::spawn(worker.run(true));

    // Let the worker claim and enter the handler, then reclaim the task
    // as a maintenance sweep on another host would.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let registry = WorkerRegistry::new(store.keys());
    assert!(registry.declare_dead(&store, "w-slow").await.expect("reclaim"));

    // The handler's return must not be committed; the worker terminates.
    let result = run.await.expect("join");
    assert!(matches!(
        result,
        Err(WorkerError::Registry(RegistryError::NoSuchWorker(_)))
    ));

    // The task sits in exactly one location: back on its queue.
    assert_eq!(
        Queue::new("default").task_ids(&store).await.expect("ids"),
        vec![t.clone()]
    );
    let finished = ExpiringRegistry::finished(store.keys());
    assert!(finished.task_ids(&store).await.expect("ids").is_empty());
    let record = Task::fetch(&store, &t).await.expect("record");
    assert_eq!(record.status, TaskStatus::Queued);
    assert!(registry
        .running_task_of(&store, "w-slow")
        .await
        .expect("slot read")
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_dead_declared_worker_cannot_claim() {
    let (store, settings) = create_test_store().await;
    let t = enqueue_task(&store, "default").await;

    let worker = test_worker(&store, &settings, &["default"], "w-zombie");
    worker.register().await.expect("register");
    let registry = WorkerRegistry::new(store.keys());
    registry.declare_dead(&store, "w-zombie").await.expect("reclaim");

    let err = worker.dequeue().await.unwrap_err();
    assert!(matches!(err, RegistryError::NoSuchWorker(_)));

    // The refused claim must not have popped anything or written a slot.
    assert_eq!(
        Queue::new("default").task_ids(&store).await.expect("ids"),
        vec![t]
    );
    assert!(registry
        .running_task_of(&store, "w-zombie")
        .await
        .expect("slot read")
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_dequeue_skips_claimed_id_without_record() {
    let (store, settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;
    let t2 = enqueue_task(&store, "default").await;

    // Delete the head task's record while its id still sits in the
    // pending list, the state a racing empty() leaves behind.
    let mut batch = Batch::new();
    batch.pipeline().del(store.keys().task(&t1)).ignore();
    store.commit(batch).await.expect("commit");

    let worker = test_worker(&store, &settings, &["default"], "w-skip");
    worker.register().await.expect("register");

    // The vanished record is skipped, not reported as an empty poll.
    let claimed = worker.dequeue().await.expect("dequeue").expect("task");
    assert_eq!(claimed.id, t2);
}

#[tokio::test]
#[ignore]
async fn test_running_task_ids_snapshot() {
    let (store, settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;
    let t2 = enqueue_task(&store, "default").await;

    let w1 = test_worker(&store, &settings, &["default"], "w-snap-1");
    let w2 = test_worker(&store, &settings, &["default"], "w-snap-2");
    w1.register().await.expect("register");
    w2.register().await.expect("register");
    w1.dequeue().await.expect("dequeue").expect("task");
    w2.dequeue().await.expect("dequeue").expect("task");

    let registry = WorkerRegistry::new(store.keys());
    let mut ids = registry.running_task_ids(&store).await.expect("scan");
    ids.sort();
    let mut expected = vec![t1, t2.clone()];
    expected.sort();
    assert_eq!(ids, expected, "snapshot must cover every live worker's slot");

    // One worker going away mid-scan can only shrink the snapshot, never
    // duplicate or leave a stale entry.
    registry.declare_dead(&store, "w-snap-1").await.expect("reclaim");
    let ids = registry.running_task_ids(&store).await.expect("scan");
    assert_eq!(ids, vec![t2]);
}

#[tokio::test]
#[ignore]
async fn test_expire_honors_ttl_boundary() {
    let (store, _settings) = create_test_store().await;
    let ttl = Duration::from_secs(60);

    let mut task = Task::with_id("tx", json!({}));
    task.status = TaskStatus::Finished;
    let finished = ExpiringRegistry::finished(store.keys());

    let now = store.server_time().await.expect("time");
    let mut batch = Batch::new();
    task.stage_save(store.keys(), &mut batch);
    finished.stage_add("tx", now - 59.0, &mut batch);
    store.commit(batch).await.expect("commit");

    // 59 seconds old with a 60 second TTL: not evictable yet.
    let evicted = finished.expire(&store, ttl).await.expect("expire");
    assert_eq!(evicted, 0);
    assert_eq!(finished.task_ids(&store).await.expect("ids"), vec!["tx".to_string()]);

    // Backdate past the TTL: evicted and the record deleted.
    let mut batch = Batch::new();
    finished.stage_add("tx", now - 61.0, &mut batch);
    store.commit(batch).await.expect("commit");

    let evicted = finished.expire(&store, ttl).await.expect("expire");
    assert_eq!(evicted, 1);
    assert!(finished.task_ids(&store).await.expect("ids").is_empty());
    assert!(matches!(
        Task::fetch(&store, "tx").await.unwrap_err(),
        StoreError::TaskNotFound(_)
    ));
}

#[tokio::test]
#[ignore]
async fn test_empty_clears_pending_but_keeps_registration() {
    let (store, _settings) = create_test_store().await;
    let t1 = enqueue_task(&store, "default").await;
    let _t2 = enqueue_task(&store, "default").await;

    let queue = Queue::new("default");
    let removed = queue.empty(&store).await.expect("empty");
    assert_eq!(removed, 2);
    assert_eq!(queue.len(&store).await.expect("len"), 0);
    assert!(matches!(
        Task::fetch(&store, &t1).await.unwrap_err(),
        StoreError::TaskNotFound(_)
    ));

    let names = QueueRegistry::new(store.keys()).names(&store).await.expect("names");
    assert_eq!(names, vec!["default".to_string()]);

    queue.deregister(&store).await.expect("deregister");
    assert!(QueueRegistry::new(store.keys()).names(&store).await.expect("names").is_empty());
}

#[tokio::test]
#[ignore]
async fn test_queue_registry_discovers_new_queues() {
    let (store, _settings) = create_test_store().await;
    enqueue_task(&store, "beta").await;
    enqueue_task(&store, "alpha").await;
    enqueue_task(&store, "alpha").await;

    let names = QueueRegistry::new(store.keys()).names(&store).await.expect("names");
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_server_time_is_monotonic_enough() {
    let (store, _settings) = create_test_store().await;
    let a = store.server_time().await.expect("time");
    let b = store.server_time().await.expect("time");
    assert!(b >= a, "server clock must not run backwards between calls");
}
