//! Error types for taskmill operations.
//!
//! Defines error types for the major subsystems:
//! - Store access (connection, Redis commands, serialization)
//! - Registry operations (worker liveness, task lookup)
//! - Worker lifecycle and task execution

use thiserror::Error;

/// Errors that can occur when talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to establish a connection to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a task payload.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A task record that a write intended to mutate does not exist.
    ///
    /// Read-only enumeration paths treat a missing record as benign and
    /// skip it instead of surfacing this error.
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    /// A stored task record contains a field that cannot be parsed.
    #[error("Corrupt task record '{id}': {reason}")]
    CorruptTask { id: String, reason: String },
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A heartbeat or claim was issued for a worker id absent from the
    /// liveness registry. The worker was reclaimed as dead and must stop:
    /// its running task may already have been requeued, and continuing
    /// would risk duplicate execution.
    #[error("Worker '{0}' is not registered (declared dead?)")]
    NoSuchWorker(String),

    /// An underlying store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that terminate a worker's run loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A store operation failed and could not be retried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StoreError::TaskNotFound("t-1".to_string());
        assert!(err.to_string().contains("t-1"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_no_such_worker_display() {
        let err = RegistryError::NoSuchWorker("w-1".to_string());
        assert!(err.to_string().contains("w-1"));
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_worker_error_from_registry() {
        let err: WorkerError = RegistryError::NoSuchWorker("w-2".to_string()).into();
        assert!(matches!(
            err,
            WorkerError::Registry(RegistryError::NoSuchWorker(_))
        ));
    }
}
