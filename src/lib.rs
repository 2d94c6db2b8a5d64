//! taskmill: a Redis-backed distributed task queue.
//!
//! Producers enqueue tasks into named queues; a pool of independent worker
//! processes dequeues and executes them. The shared Redis instance is the
//! single source of truth: registries track task outcomes and worker
//! liveness, and every multi-key state transition runs as an atomic batch
//! or server-side script, so concurrent producers and workers always see
//! consistent answers to "what is pending, running, finished, failed" and
//! "which workers are alive".

pub mod cli;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod queue;
pub mod registry;
pub mod store;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use config::Settings;
pub use error::{RegistryError, StoreError, WorkerError};
pub use maintenance::{registry_maintenance, MaintenanceReport};
pub use queue::Queue;
pub use registry::{ExpiringRegistry, QueueRegistry, WorkerRegistry};
pub use store::{Batch, Keys, Store};
pub use task::{Task, TaskStatus};
pub use worker::{FailureHandler, TaskHandler, Worker};
