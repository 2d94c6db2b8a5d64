//! Redis connection handle and key naming scheme.

use redis::aio::ConnectionManager;

use crate::error::StoreError;

use super::Batch;

/// Key naming scheme for all broker state.
///
/// Every key lives under a configurable prefix so multiple deployments can
/// share one Redis database. The `*_prefix` accessors exist for the Lua
/// scripts that derive per-task and per-worker keys server-side.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    /// Creates a key scheme under the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Pending-list key for a named queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.prefix, name)
    }

    /// Prefix from which queue keys are derived (`queue key = prefix + name`).
    pub fn queue_prefix(&self) -> String {
        format!("{}:queue:", self.prefix)
    }

    /// Hash key holding a task record.
    pub fn task(&self, id: &str) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    /// Prefix from which task keys are derived.
    pub fn task_prefix(&self) -> String {
        format!("{}:task:", self.prefix)
    }

    /// Sorted set of worker ids scored by last heartbeat.
    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    /// Single-slot key holding the task id a worker is currently running.
    pub fn running_slot(&self, worker_id: &str) -> String {
        format!("{}:worker_task:{}", self.prefix, worker_id)
    }

    /// Prefix from which running-slot keys are derived.
    pub fn running_slot_prefix(&self) -> String {
        format!("{}:worker_task:", self.prefix)
    }

    /// Set of known queue names.
    pub fn queue_registry(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Sorted set backing an expiring registry (`finished` or `failed`).
    pub fn expiring_registry(&self, name: &str) -> String {
        format!("{}:{}_tasks", self.prefix, name)
    }
}

/// Handle over the shared Redis instance.
///
/// Cheap to clone; the underlying [`ConnectionManager`] multiplexes one
/// connection and reconnects automatically.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    keys: Keys,
}

impl Store {
    /// Connects to Redis and creates a store handle.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection cannot be
    /// established.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            conn,
            keys: Keys::new(key_prefix),
        })
    }

    /// Creates a store from an existing connection manager.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn from_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            keys: Keys::new(key_prefix),
        }
    }

    /// Returns the key naming scheme.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Returns a cloned connection for issuing commands.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Fractional-second timestamp from the Redis `TIME` command.
    ///
    /// All sorted-set scores use this server-side clock rather than client
    /// wall-clock, so producers and workers with skewed clocks still agree
    /// on ordering and timeouts.
    pub async fn server_time(&self) -> Result<f64, StoreError> {
        let mut conn = self.connection();
        let (seconds, microseconds): (u64, u64) =
            redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(seconds as f64 + microseconds as f64 * 1e-6)
    }

    /// Commits a batch, applying all staged writes as one atomic unit.
    ///
    /// On error nothing from the batch is visible to any observer; callers
    /// retry the whole composed operation, never individual sub-steps.
    pub async fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        let mut conn = self.connection();
        batch.into_pipeline().query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_scheme() {
        let keys = Keys::new("tm");

        assert_eq!(keys.queue("default"), "tm:queue:default");
        assert_eq!(keys.queue_prefix(), "tm:queue:");
        assert_eq!(keys.task("abc"), "tm:task:abc");
        assert_eq!(keys.task_prefix(), "tm:task:");
        assert_eq!(keys.workers(), "tm:workers");
        assert_eq!(keys.running_slot("w1"), "tm:worker_task:w1");
        assert_eq!(keys.running_slot_prefix(), "tm:worker_task:");
        assert_eq!(keys.queue_registry(), "tm:queues");
        assert_eq!(keys.expiring_registry("finished"), "tm:finished_tasks");
        assert_eq!(keys.expiring_registry("failed"), "tm:failed_tasks");
    }

    #[test]
    fn test_derived_keys_compose() {
        // The Lua scripts build keys by concatenation; the prefix accessors
        // must line up with the full-key accessors.
        let keys = Keys::new("tm");

        assert_eq!(format!("{}t1", keys.task_prefix()), keys.task("t1"));
        assert_eq!(format!("{}q1", keys.queue_prefix()), keys.queue("q1"));
        assert_eq!(
            format!("{}w1", keys.running_slot_prefix()),
            keys.running_slot("w1")
        );
    }
}
