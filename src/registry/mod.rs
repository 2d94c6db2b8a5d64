//! Server-side registries tracking tasks and workers.
//!
//! Registries are indexes over shared Redis state, distinct from the
//! queues themselves:
//!
//! - [`ExpiringRegistry`]: time-ordered index of finished or failed task
//!   ids with TTL-based lazy eviction
//! - [`WorkerRegistry`]: worker liveness via heartbeat timestamps, plus
//!   the atomic "which task is each worker running" view and dead-worker
//!   reclamation
//! - [`QueueRegistry`]: the set of known queue names

mod expiring;
mod queues;
mod worker;

pub use expiring::ExpiringRegistry;
pub use queues::QueueRegistry;
pub use worker::WorkerRegistry;
