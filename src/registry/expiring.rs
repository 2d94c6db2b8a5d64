//! Time-ordered registries of completed task ids with TTL eviction.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{Batch, Keys, Store};
use crate::task::Task;

/// A score-ordered index of completed task ids.
///
/// Two instances exist per deployment: `finished` and `failed`. Scores are
/// server timestamps of insertion time. Eviction is lazy: entries older
/// than the TTL are removed only when [`expire`](Self::expire) runs, so
/// between maintenance sweeps expired entries may still be queried.
#[derive(Debug, Clone)]
pub struct ExpiringRegistry {
    key: String,
    keys: Keys,
}

impl ExpiringRegistry {
    /// The registry of successfully finished tasks.
    pub fn finished(keys: &Keys) -> Self {
        Self::named(keys, "finished")
    }

    /// The registry of failed tasks.
    pub fn failed(keys: &Keys) -> Self {
        Self::named(keys, "failed")
    }

    fn named(keys: &Keys, name: &str) -> Self {
        Self {
            key: keys.expiring_registry(name),
            keys: keys.clone(),
        }
    }

    /// The Redis key of the underlying zset, for server-side scripts
    /// that index into this registry.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stages insertion of `(task_id, now)`.
    ///
    /// Idempotent: adding an already-present id upserts its score.
    pub fn stage_add(&self, task_id: &str, now: f64, batch: &mut Batch) {
        batch.pipeline().zadd(&self.key, task_id, now).ignore();
    }

    /// Returns all indexed task ids, oldest first.
    pub async fn task_ids(&self, store: &Store) -> Result<Vec<String>, StoreError> {
        let mut conn = store.connection();
        let ids: Vec<String> = conn.zrange(&self.key, 0, -1).await?;
        Ok(ids)
    }

    /// Evicts entries older than `ttl` and deletes their task records.
    ///
    /// The cutoff is computed once; the range read and the range removal
    /// run against that same cutoff inside one MULTI, so an entry scored
    /// after the cutoff was computed is never deleted even if it lands
    /// between the two steps. Task records are deleted only after their
    /// registry entries are gone, so a task is never observable as
    /// missing from the registry while still pending deletion the other
    /// way around.
    ///
    /// Returns the number of entries evicted.
    pub async fn expire(&self, store: &Store, ttl: Duration) -> Result<usize, StoreError> {
        let now = store.server_time().await?;
        let cutoff = now - ttl.as_secs_f64();

        let mut conn = store.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrangebyscore(&self.key, 0f64, cutoff)
            .zrembyscore(&self.key, 0f64, cutoff)
            .ignore();
        let (expired,): (Vec<String>,) = pipe.query_async(&mut conn).await?;

        if !expired.is_empty() {
            let mut batch = Batch::new();
            Task::stage_delete_many(&self.keys, &expired, &mut batch);
            store.commit(batch).await?;
            debug!(registry = %self.key, evicted = expired.len(), "registry entries expired");
        }
        Ok(expired.len())
    }
}
