//! The worker: claims tasks from its assigned queues, executes them, and
//! reports liveness via heartbeats.
//!
//! Each worker is an independent OS process, single-threaded with respect
//! to its own execution loop (one task in flight at a time). All
//! cross-process coordination goes through the store's atomicity
//! primitives; no client-side locks exist anywhere.
//!
//! Dequeue is polling-mode: a server-side script pops the head of the
//! first non-empty assigned queue and, in the same atomic step, records
//! the task in the worker's running slot, flips the task to `running`,
//! and refreshes the heartbeat. When every queue is empty the worker
//! sleeps for the configured poll interval before trying again.
//!
//! Heartbeats keep flowing while a handler executes, and every state
//! transition checks ownership on the server side: a worker that has been
//! declared dead can neither claim new work nor commit the outcome of a
//! task that was already reclaimed from it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{RegistryError, StoreError, WorkerError};
use crate::maintenance::registry_maintenance;
use crate::queue::Queue;
use crate::registry::{ExpiringRegistry, WorkerRegistry};
use crate::store::{Batch, Store};
use crate::task::{Task, TaskStatus};

/// Commit attempts for a task-outcome batch before the worker gives up.
const OUTCOME_COMMIT_ATTEMPTS: u32 = 3;

/// Atomic claim: pop the head of the first non-empty queue, record the id
/// in the worker's running slot, flip the task record to running, and
/// refresh the heartbeat, all in one indivisible step.
///
/// A worker absent from the liveness zset has been declared dead and must
/// not claim: its slot would be invisible to slot enumeration and to
/// dead-worker reclamation, so a crash afterwards would drop the task.
/// The script refuses with a `GONE` status before touching any queue.
///
/// KEYS: [workers zset, running slot, queue keys in priority order...]
/// ARGV: [worker_id, now, task key prefix]
/// Returns the claimed task id, nil when every queue is empty, or `GONE`.
const CLAIM_SCRIPT: &str = r#"
if not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
    return redis.status_reply("GONE")
end
for i = 3, #KEYS do
    local task_id = redis.call("LPOP", KEYS[i])
    if task_id then
        redis.call("SET", KEYS[2], task_id)
        redis.call("ZADD", KEYS[1], "XX", ARGV[2], ARGV[1])
        redis.call("HSET", ARGV[3] .. task_id, "status", "running", "started_at", ARGV[2])
        return task_id
    end
end
return false
"#;

/// Atomic outcome commit, conditional on still owning the running slot.
///
/// If the slot no longer holds this task id, the task was reclaimed by a
/// dead-worker sweep and already requeued; applying the finish or fail
/// writes anyway would make the id observable in a queue and a registry
/// at the same time. The script returns 0 and writes nothing in that
/// case. On success it clears the slot, updates the task record, and
/// indexes the id in the outcome registry as one step.
///
/// KEYS: [running slot, task key, registry zset]
/// ARGV: [task_id, now, status, error (optional)]
const OUTCOME_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call("DEL", KEYS[1])
redis.call("HSET", KEYS[2], "status", ARGV[3], "ended_at", ARGV[2])
if ARGV[4] then
    redis.call("HSET", KEYS[2], "error", ARGV[4])
end
redis.call("ZADD", KEYS[3], ARGV[2], ARGV[1])
return 1
"#;

/// Execution seam for task payloads.
///
/// Implementations interpret the opaque payload and do the actual work.
/// The concrete sandboxing (fork/exec etc.) lives behind this trait; the
/// broker core only needs the outcome.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes one task. An `Err` marks the task failed with the error's
    /// string form as its error payload.
    async fn run(&self, task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Receives failure notifications before the failure is committed.
///
/// Integration point for external error reporting; not required for
/// correctness.
pub trait FailureHandler: Send + Sync {
    /// Called once per failed task, before the failed state is committed.
    fn handle_failure(&self, worker_id: &str, task: &Task, error: &str);
}

/// What became of one claimed task.
enum ProcessOutcome {
    /// The outcome was committed to the task record and a registry.
    Recorded,
    /// The task was reclaimed from this worker; nothing was committed.
    Reclaimed,
}

/// A worker process: registers itself, claims and executes tasks from its
/// assigned queues in priority order, and records outcomes.
pub struct Worker {
    id: String,
    queues: Vec<Queue>,
    store: Store,
    settings: Settings,
    handler: Arc<dyn TaskHandler>,
    failure_handlers: Vec<Box<dyn FailureHandler>>,
    registry: WorkerRegistry,
    finished: ExpiringRegistry,
    failed: ExpiringRegistry,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    /// Creates a worker bound to the given queues.
    ///
    /// The first-listed queue drains first; within a queue delivery is
    /// FIFO.
    pub fn new(
        store: Store,
        queue_names: Vec<String>,
        handler: Arc<dyn TaskHandler>,
        settings: Settings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let registry = WorkerRegistry::new(store.keys());
        let finished = ExpiringRegistry::finished(store.keys());
        let failed = ExpiringRegistry::failed(store.keys());

        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            queues: queue_names.into_iter().map(Queue::new).collect(),
            store,
            settings,
            handler,
            failure_handlers: Vec::new(),
            registry,
            finished,
            failed,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Overrides the generated worker id.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.id = name.into();
        self
    }

    /// Registers a failure handler.
    pub fn with_failure_handler(mut self, handler: Box<dyn FailureHandler>) -> Self {
        self.failure_handlers.push(handler);
        self
    }

    /// Returns the worker id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a handle that requests a graceful stop when sent to.
    ///
    /// The worker finishes its in-flight task before exiting.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs the worker loop until shutdown.
    ///
    /// In burst mode the loop exits as soon as a poll finds every assigned
    /// queue empty. Being declared dead is fatal wherever it surfaces
    /// (heartbeat, claim, or outcome commit): this worker's task may
    /// already be requeued, so continuing would risk duplicate execution.
    pub async fn run(mut self, burst: bool) -> Result<(), WorkerError> {
        self.register().await?;
        info!(
            worker_id = %self.id,
            queues = ?self.queues.iter().map(Queue::name).collect::<Vec<_>>(),
            burst,
            "worker started"
        );

        let mut last_heartbeat = Instant::now();
        let mut last_maintenance = Instant::now();

        let outcome = loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "worker received shutdown signal");
                    break Ok(());
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                match self.registry.heartbeat(&self.store, &self.id).await {
                    Ok(()) => last_heartbeat = Instant::now(),
                    Err(e @ RegistryError::NoSuchWorker(_)) => {
                        error!(worker_id = %self.id, "declared dead while alive, terminating");
                        break Err(WorkerError::Registry(e));
                    }
                    Err(RegistryError::Store(e)) => {
                        warn!(worker_id = %self.id, error = %e, "heartbeat failed, will retry");
                    }
                }
            }

            if last_maintenance.elapsed() >= self.settings.maintenance_interval {
                registry_maintenance(&self.store, &self.settings).await;
                last_maintenance = Instant::now();
            }

            match self.dequeue().await {
                Ok(Some(task)) => match self.process(task).await {
                    Ok(ProcessOutcome::Recorded) => {}
                    Ok(ProcessOutcome::Reclaimed) => {
                        error!(worker_id = %self.id, "declared dead while executing, terminating");
                        break Err(WorkerError::Registry(RegistryError::NoSuchWorker(
                            self.id.clone(),
                        )));
                    }
                    Err(e) => {
                        // The outcome commit failed repeatedly. Exit without
                        // deregistering: the liveness entry must stay so
                        // dead-worker reclamation requeues the task still
                        // referenced by this worker's running slot.
                        error!(worker_id = %self.id, error = %e, "failed to record task outcome, terminating");
                        return Err(e.into());
                    }
                },
                Ok(None) => {
                    if burst {
                        info!(worker_id = %self.id, "burst mode: all queues drained");
                        break Ok(());
                    }
                    debug!(worker_id = %self.id, "no tasks available");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Err(e @ RegistryError::NoSuchWorker(_)) => {
                    error!(worker_id = %self.id, "declared dead while alive, terminating");
                    break Err(WorkerError::Registry(e));
                }
                Err(RegistryError::Store(e)) => {
                    error!(worker_id = %self.id, error = %e, "dequeue failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        };

        if let Err(e) = self.deregister().await {
            warn!(worker_id = %self.id, error = %e, "failed to deregister worker");
        }
        info!(worker_id = %self.id, "worker stopped");
        outcome
    }

    /// Adds this worker to the liveness registry.
    pub async fn register(&self) -> Result<(), StoreError> {
        let now = self.store.server_time().await?;
        let mut batch = Batch::new();
        self.registry.stage_add(&self.id, now, &mut batch);
        self.store.commit(batch).await
    }

    /// Removes this worker's liveness entry.
    ///
    /// Only called with an empty running slot: the loop stops between
    /// tasks, never mid-execution.
    pub async fn deregister(&self) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        self.registry.stage_remove(&self.id, &mut batch);
        self.store.commit(batch).await
    }

    /// Claims the next task from the assigned queues, if any.
    ///
    /// The claim itself is one server-side script (see [`CLAIM_SCRIPT`]);
    /// the subsequent record fetch is a plain read of state only this
    /// worker may now mutate. A claimed id whose record has vanished
    /// (an explicit `empty()` racing the claim) is released and the
    /// claim retried, so "record vanished" is never reported as "all
    /// queues empty".
    ///
    /// Returns `NoSuchWorker` when this worker has been declared dead;
    /// callers must stop claiming.
    pub async fn dequeue(&self) -> Result<Option<Task>, RegistryError> {
        let keys = self.store.keys();
        loop {
            let now = self.store.server_time().await?;

            let script = redis::Script::new(CLAIM_SCRIPT);
            let mut invocation = script.prepare_invoke();
            invocation.key(keys.workers()).key(keys.running_slot(&self.id));
            for queue in &self.queues {
                invocation.key(keys.queue(queue.name()));
            }
            invocation.arg(&self.id).arg(now).arg(keys.task_prefix());

            let mut conn = self.store.connection();
            let claimed: redis::Value = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(StoreError::from)?;

            let task_id = match claimed {
                redis::Value::Nil => return Ok(None),
                redis::Value::Status(ref status) if status == "GONE" => {
                    return Err(RegistryError::NoSuchWorker(self.id.clone()));
                }
                other => redis::from_redis_value::<String>(&other).map_err(StoreError::from)?,
            };

            match Task::fetch(&self.store, &task_id).await {
                Ok(task) => {
                    debug!(worker_id = %self.id, task_id = %task.id, "task claimed");
                    return Ok(Some(task));
                }
                Err(StoreError::TaskNotFound(_)) => {
                    warn!(worker_id = %self.id, task_id = %task_id, "claimed task has no record, skipping");
                    let mut conn = self.store.connection();
                    conn.del::<_, ()>(keys.running_slot(&self.id))
                        .await
                        .map_err(StoreError::from)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Executes one task and records its outcome.
    ///
    /// The heartbeat keeps flowing while the handler runs, so a task may
    /// legitimately execute longer than the heartbeat timeout. If the
    /// liveness entry disappears anyway, the execution is abandoned: the
    /// reclaim sweep has already requeued the task for someone else.
    async fn process(&self, mut task: Task) -> Result<ProcessOutcome, StoreError> {
        info!(worker_id = %self.id, task_id = %task.id, "processing task");
        let started = Instant::now();

        let error = {
            let run = self.handler.run(&task);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => {
                        break match result {
                            Ok(()) => None,
                            Err(e) => Some(e.to_string()),
                        };
                    }
                    _ = tokio::time::sleep(self.settings.heartbeat_interval) => {
                        match self.registry.heartbeat(&self.store, &self.id).await {
                            Ok(()) => {}
                            Err(RegistryError::NoSuchWorker(_)) => {
                                warn!(
                                    worker_id = %self.id,
                                    task_id = %task.id,
                                    "declared dead mid-execution, abandoning task"
                                );
                                return Ok(ProcessOutcome::Reclaimed);
                            }
                            Err(RegistryError::Store(e)) => {
                                warn!(worker_id = %self.id, error = %e, "heartbeat failed, will retry");
                            }
                        }
                    }
                }
            }
        };

        if let Some(ref error) = error {
            for handler in &self.failure_handlers {
                handler.handle_failure(&self.id, &task, error);
            }
        }

        if !self.record_outcome(&mut task, error.as_deref()).await? {
            warn!(
                worker_id = %self.id,
                task_id = %task.id,
                "task was reclaimed before its outcome could be recorded, discarding"
            );
            return Ok(ProcessOutcome::Reclaimed);
        }

        let duration_ms = started.elapsed().as_millis();
        match task.status {
            TaskStatus::Finished => {
                info!(worker_id = %self.id, task_id = %task.id, duration_ms, "task finished");
            }
            _ => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    duration_ms,
                    error = ?task.error,
                    "task failed"
                );
            }
        }
        Ok(ProcessOutcome::Recorded)
    }

    /// Commits the task outcome via [`OUTCOME_SCRIPT`].
    ///
    /// Returns `Ok(false)` when the running slot no longer holds this
    /// task, meaning the outcome was discarded. Transient commit failures
    /// leave no partial state, so the commit is simply retried a bounded
    /// number of times.
    async fn record_outcome(
        &self,
        task: &mut Task,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut attempt = 0;
        loop {
            match self.try_record_outcome(task, error).await {
                Ok(committed) => return Ok(committed),
                Err(e) => {
                    attempt += 1;
                    if attempt >= OUTCOME_COMMIT_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %e,
                        attempt,
                        "outcome commit failed, retrying"
                    );
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    async fn try_record_outcome(
        &self,
        task: &mut Task,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = self.store.server_time().await?;
        let registry = match error {
            None => {
                task.status = TaskStatus::Finished;
                &self.finished
            }
            Some(error) => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                &self.failed
            }
        };
        task.ended_at = Some(now);

        let keys = self.store.keys();
        let script = redis::Script::new(OUTCOME_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(keys.running_slot(&self.id))
            .key(keys.task(&task.id))
            .key(registry.key());
        invocation.arg(&task.id).arg(now).arg(task.status.as_str());
        if let Some(error) = error {
            invocation.arg(error);
        }

        let mut conn = self.store.connection();
        let committed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(committed == 1)
    }
}
