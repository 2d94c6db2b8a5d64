//! Periodic registry maintenance.
//!
//! Eviction and reclamation are lazy: nothing happens between sweeps, so
//! TTLs and heartbeat timeouts are lower bounds, not precise deadlines.
//! The sweep is safe to run concurrently from any number of processes and
//! is idempotent: re-running over already-clean registries is a no-op.

use tracing::{info, warn};

use crate::config::Settings;
use crate::registry::{ExpiringRegistry, WorkerRegistry};
use crate::store::Store;

/// What one maintenance sweep accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries evicted from the finished registry.
    pub finished_evicted: usize,
    /// Entries evicted from the failed registry.
    pub failed_evicted: usize,
    /// Dead workers reclaimed (tasks requeued, liveness entries removed).
    pub workers_reclaimed: usize,
}

impl MaintenanceReport {
    /// Returns whether the sweep changed anything.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs one maintenance sweep: expire both expiring registries, then
/// reclaim dead workers.
///
/// Each step tolerates failure independently: a store hiccup in one
/// registry must not stall dead-worker reclamation, so the sweep never
/// errors; callers retry on the next interval.
pub async fn registry_maintenance(store: &Store, settings: &Settings) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    let finished = ExpiringRegistry::finished(store.keys());
    match finished.expire(store, settings.registry_ttl).await {
        Ok(evicted) => report.finished_evicted = evicted,
        Err(e) => warn!(error = %e, "failed to expire finished registry"),
    }

    let failed = ExpiringRegistry::failed(store.keys());
    match failed.expire(store, settings.registry_ttl).await {
        Ok(evicted) => report.failed_evicted = evicted,
        Err(e) => warn!(error = %e, "failed to expire failed registry"),
    }

    let workers = WorkerRegistry::new(store.keys());
    match workers
        .handle_dead_workers(store, settings.heartbeat_timeout)
        .await
    {
        Ok(reclaimed) => report.workers_reclaimed = reclaimed,
        Err(e) => warn!(error = %e, "failed to reclaim dead workers"),
    }

    if !report.is_noop() {
        info!(
            finished_evicted = report.finished_evicted,
            failed_evicted = report.failed_evicted,
            workers_reclaimed = report.workers_reclaimed,
            "registry maintenance complete"
        );
    }
    report
}
