//! Named FIFO queues of pending task ids.
//!
//! A queue is a Redis list: `enqueue` pushes to the tail (RPUSH) and the
//! worker claim script pops from the head (LPOP), so the oldest enqueued
//! task is dequeued first. Dead-worker reclamation pushes to the head
//! instead, which is the single ordering exception: a requeued task is
//! delivered before everything else pending in its queue.
//!
//! Queue existence is tracked in the queue registry, independent of whether
//! the pending list currently holds anything.

use redis::AsyncCommands;
use tracing::debug;

use crate::error::StoreError;
use crate::registry::QueueRegistry;
use crate::store::{Batch, Keys, Store};
use crate::task::{Task, TaskStatus};

/// Atomically snapshots and clears a pending list, deleting the task
/// records on it. Returns the number of tasks removed.
const EMPTY_SCRIPT: &str = r#"
local ids = redis.call("LRANGE", KEYS[1], 0, -1)
redis.call("DEL", KEYS[1])
for _, id in ipairs(ids) do
    redis.call("DEL", ARGV[1] .. id)
end
return #ids
"#;

/// A named, ordered waiting list of pending task ids.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
}

impl Queue {
    /// Creates a handle for the named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a task.
    ///
    /// One atomic batch: write the task record (status `queued`), push the
    /// id to the tail of the pending list, and register the queue name.
    /// The task's `queue` and `enqueued_at` fields are updated in place.
    pub async fn enqueue(&self, store: &Store, task: &mut Task) -> Result<(), StoreError> {
        let now = store.server_time().await?;
        task.status = TaskStatus::Queued;
        task.queue = Some(self.name.clone());
        task.enqueued_at = Some(now);

        let mut batch = Batch::new();
        task.stage_save(store.keys(), &mut batch);
        self.stage_push_back(store.keys(), &task.id, &mut batch);
        QueueRegistry::new(store.keys()).stage_add(&self.name, &mut batch);
        store.commit(batch).await?;

        debug!(task_id = %task.id, queue = %self.name, "task enqueued");
        Ok(())
    }

    /// Stages a tail push of a task id.
    pub fn stage_push_back(&self, keys: &Keys, task_id: &str, batch: &mut Batch) {
        batch.pipeline().rpush(keys.queue(&self.name), task_id).ignore();
    }

    /// Stages a head push of a task id (priority re-delivery).
    pub fn stage_push_front(&self, keys: &Keys, task_id: &str, batch: &mut Batch) {
        batch.pipeline().lpush(keys.queue(&self.name), task_id).ignore();
    }

    /// Returns the number of pending tasks.
    pub async fn len(&self, store: &Store) -> Result<usize, StoreError> {
        let mut conn = store.connection();
        let len: usize = conn.llen(store.keys().queue(&self.name)).await?;
        Ok(len)
    }

    /// Returns whether the pending list is empty.
    pub async fn is_empty(&self, store: &Store) -> Result<bool, StoreError> {
        Ok(self.len(store).await? == 0)
    }

    /// Returns all pending task ids in delivery order (head first).
    pub async fn task_ids(&self, store: &Store) -> Result<Vec<String>, StoreError> {
        let mut conn = store.connection();
        let ids: Vec<String> = conn.lrange(store.keys().queue(&self.name), 0, -1).await?;
        Ok(ids)
    }

    /// Removes all pending tasks and deletes their records.
    ///
    /// Snapshot and clear happen in one server-side script so a
    /// concurrently enqueued task is either fully kept or fully removed.
    /// The queue stays registered; only explicit deregistration removes it
    /// from the queue registry.
    ///
    /// Returns the number of tasks removed.
    pub async fn empty(&self, store: &Store) -> Result<usize, StoreError> {
        let mut conn = store.connection();
        let removed: usize = redis::Script::new(EMPTY_SCRIPT)
            .key(store.keys().queue(&self.name))
            .arg(store.keys().task_prefix())
            .invoke_async(&mut conn)
            .await?;

        debug!(queue = %self.name, removed, "queue emptied");
        Ok(removed)
    }

    /// Deregisters the queue name from the queue registry.
    pub async fn deregister(&self, store: &Store) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        QueueRegistry::new(store.keys()).stage_remove(&self.name, &mut batch);
        store.commit(batch).await
    }
}
