//! Worker liveness registry.
//!
//! A sorted set maps worker ids to their last heartbeat timestamp. Each
//! worker additionally owns a single-slot running-task key; the
//! correlation between the two ("which task is each worker running") and
//! the reclamation of dead workers both execute as server-side scripts,
//! because they span a dynamically-sized key set and must not race against
//! workers starting or finishing tasks mid-scan.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::error::{RegistryError, StoreError};
use crate::store::{Batch, Keys, Store};

/// Atomic multi-key read: for every worker in the liveness set, collect
/// the task id in its running slot, if any. ARGV[1] is the running-slot
/// key prefix.
const RUNNING_TASK_IDS_SCRIPT: &str = r#"
local worker_ids = redis.call("ZRANGE", KEYS[1], 0, -1)
local task_ids = {}
for _, worker_id in ipairs(worker_ids) do
    local task_id = redis.call("GET", ARGV[1] .. worker_id)
    if task_id then
        table.insert(task_ids, task_id)
    end
end
return task_ids
"#;

/// Declares one worker dead. If its running slot holds a task id, the
/// task is pushed back onto the *front* of its recorded queue and its
/// status reverts to queued; then the slot and the liveness entry are
/// removed. Runs as one script so the task is never observable in
/// neither the queue nor any running slot.
///
/// KEYS: [workers zset, running slot]
/// ARGV: [worker_id, task key prefix, queue key prefix]
/// Returns 1 if the liveness entry was removed, 0 if it was already gone.
const DECLARE_DEAD_SCRIPT: &str = r#"
local task_id = redis.call("GET", KEYS[2])
if task_id then
    local queue = redis.call("HGET", ARGV[2] .. task_id, "queue")
    if queue then
        redis.call("LPUSH", ARGV[3] .. queue, task_id)
        redis.call("HSET", ARGV[2] .. task_id, "status", "queued")
    end
    redis.call("DEL", KEYS[2])
end
return redis.call("ZREM", KEYS[1], ARGV[1])
"#;

/// Tracks the set of live workers via heartbeat timestamps.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    key: String,
    keys: Keys,
}

impl WorkerRegistry {
    /// Creates a handle over the liveness registry.
    pub fn new(keys: &Keys) -> Self {
        Self {
            key: keys.workers(),
            keys: keys.clone(),
        }
    }

    /// Stages insertion of `(worker_id, now)` into the liveness set.
    pub fn stage_add(&self, worker_id: &str, now: f64, batch: &mut Batch) {
        batch.pipeline().zadd(&self.key, worker_id, now).ignore();
    }

    /// Stages removal of a worker's liveness entry.
    pub fn stage_remove(&self, worker_id: &str, batch: &mut Batch) {
        batch.pipeline().zrem(&self.key, worker_id).ignore();
    }

    /// Refreshes a worker's heartbeat timestamp.
    ///
    /// Update-only (`ZADD XX CH`): an absent id is never re-inserted.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NoSuchWorker` if the id is not in the
    /// registry; the worker was reclaimed as dead and must treat this as
    /// fatal rather than silently re-registering.
    pub async fn heartbeat(&self, store: &Store, worker_id: &str) -> Result<(), RegistryError> {
        let now = store.server_time().await?;
        let mut conn = store.connection();
        let updated: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg("XX")
            .arg("CH")
            .arg(now)
            .arg(worker_id)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        if updated == 0 {
            return Err(RegistryError::NoSuchWorker(worker_id.to_string()));
        }
        Ok(())
    }

    /// Returns all registered worker ids, live and not-yet-reclaimed-dead.
    pub async fn worker_ids(&self, store: &Store) -> Result<Vec<String>, StoreError> {
        let mut conn = store.connection();
        let ids: Vec<String> = conn.zrangebyscore(&self.key, "-inf", "+inf").await?;
        Ok(ids)
    }

    /// Returns `(worker_id, last_heartbeat)` pairs, oldest heartbeat first.
    pub async fn entries(&self, store: &Store) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = store.connection();
        let entries: Vec<(String, f64)> = conn.zrange_withscores(&self.key, 0, -1).await?;
        Ok(entries)
    }

    /// Returns ids whose heartbeat is older than the timeout.
    ///
    /// A worker whose last heartbeat is at time T is never classified dead
    /// before `T + timeout`.
    pub async fn dead_ids(
        &self,
        store: &Store,
        timeout: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let now = store.server_time().await?;
        let oldest_valid = now - timeout.as_secs_f64();
        let mut conn = store.connection();
        let ids: Vec<String> = conn.zrangebyscore(&self.key, "-inf", oldest_valid).await?;
        Ok(ids)
    }

    /// Returns the task ids currently held in running slots, in
    /// worker-enumeration order.
    ///
    /// Computed entirely server-side so the result is one consistent
    /// snapshot: a non-atomic read-after-enumerate could report a task for
    /// a worker that already moved on, or miss one that just started.
    pub async fn running_task_ids(&self, store: &Store) -> Result<Vec<String>, StoreError> {
        let mut conn = store.connection();
        let ids: Vec<String> = redis::Script::new(RUNNING_TASK_IDS_SCRIPT)
            .key(&self.key)
            .arg(self.keys.running_slot_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Returns the task id a single worker is currently running, if any.
    ///
    /// Plain read for monitoring views; use
    /// [`running_task_ids`](Self::running_task_ids) where a consistent
    /// cross-worker snapshot matters.
    pub async fn running_task_of(
        &self,
        store: &Store,
        worker_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = store.connection();
        let id: Option<String> = conn.get(self.keys.running_slot(worker_id)).await?;
        Ok(id)
    }

    /// Reclaims one dead worker: requeues its running task at the front of
    /// the task's original queue and removes its liveness entry and slot.
    ///
    /// Returns whether the liveness entry was present. Re-running on an
    /// already-reclaimed id is a no-op.
    pub async fn declare_dead(&self, store: &Store, worker_id: &str) -> Result<bool, StoreError> {
        let mut conn = store.connection();
        let removed: i64 = redis::Script::new(DECLARE_DEAD_SCRIPT)
            .key(&self.key)
            .key(self.keys.running_slot(worker_id))
            .arg(worker_id)
            .arg(self.keys.task_prefix())
            .arg(self.keys.queue_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    /// Maintenance entry point: reclaims every worker whose heartbeat has
    /// gone stale.
    ///
    /// Per-item failures are logged and skipped so one vanished record
    /// does not stall the sweep. Returns the number of workers reclaimed.
    pub async fn handle_dead_workers(
        &self,
        store: &Store,
        timeout: Duration,
    ) -> Result<usize, StoreError> {
        let dead = self.dead_ids(store, timeout).await?;
        let mut reclaimed = 0;

        for worker_id in dead {
            match self.declare_dead(store, &worker_id).await {
                Ok(true) => {
                    warn!(worker_id = %worker_id, "dead worker reclaimed");
                    reclaimed += 1;
                }
                Ok(false) => {
                    debug!(worker_id = %worker_id, "worker already reclaimed, skipping");
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "failed to reclaim worker, skipping");
                }
            }
        }
        Ok(reclaimed)
    }
}
