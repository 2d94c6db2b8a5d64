//! Runtime settings for the broker.
//!
//! All tuning knobs are plain values resolved by the process layer (CLI
//! flags and environment variables) and handed to the core as data. The
//! core never reads configuration sources itself.

use std::time::Duration;

/// Default retention for the finished/failed registries (7 days).
const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default time after the last heartbeat before a worker is considered dead.
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between heartbeats emitted by a running worker.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default sleep between empty dequeue polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval between maintenance sweeps run by a worker.
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Settings shared by workers, producers and the monitoring CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix under which every Redis key lives.
    pub key_prefix: String,
    /// Minimum retention before finished/failed registry entries become
    /// eligible for eviction.
    pub registry_ttl: Duration,
    /// How stale a heartbeat may be before the worker is declared dead.
    pub heartbeat_timeout: Duration,
    /// How often a running worker refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Sleep between dequeue polls when all queues are empty.
    pub poll_interval: Duration,
    /// How often a worker runs the registry maintenance sweep.
    pub maintenance_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "taskmill".to_string(),
            registry_ttl: DEFAULT_REGISTRY_TTL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

impl Settings {
    /// Creates settings pointing at the given Redis URL.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Default::default()
        }
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the registry retention TTL.
    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.registry_ttl = ttl;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maintenance interval.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}
