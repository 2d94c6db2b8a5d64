//! Registry of known queue names.

use redis::AsyncCommands;

use crate::error::StoreError;
use crate::store::{Batch, Keys, Store};

/// The set of queue names that have ever been enqueued to.
///
/// Membership is the sole state; a queue stays registered when emptied and
/// is removed only by explicit deregistration.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    key: String,
}

impl QueueRegistry {
    /// Creates a handle over the queue-name registry.
    pub fn new(keys: &Keys) -> Self {
        Self {
            key: keys.queue_registry(),
        }
    }

    /// Returns all registered names, lexicographically sorted.
    ///
    /// Sorting happens here so monitoring output is deterministic.
    pub async fn names(&self, store: &Store) -> Result<Vec<String>, StoreError> {
        let mut conn = store.connection();
        let mut names: Vec<String> = conn.smembers(&self.key).await?;
        names.sort();
        Ok(names)
    }

    /// Stages registration of a queue name. Idempotent.
    pub fn stage_add(&self, name: &str, batch: &mut Batch) {
        batch.pipeline().sadd(&self.key, name).ignore();
    }

    /// Stages deregistration of a queue name. Idempotent.
    pub fn stage_remove(&self, name: &str, batch: &mut Batch) {
        batch.pipeline().srem(&self.key, name).ignore();
    }
}
