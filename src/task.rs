//! The task entity: one unit of queued work with an identity and a
//! lifecycle status.
//!
//! Tasks are persisted as Redis hashes (one hash per task) so that the
//! server-side claim and reclamation scripts can flip individual fields
//! (`status`, `started_at`) atomically without a client round trip.
//!
//! Lifecycle: `queued -> running -> {finished | failed}`, with a
//! `running -> queued` edge when the task's worker is reclaimed as dead.
//! A task id appears in at most one of a queue's pending list, a worker's
//! running slot, or an expiring registry at any time.

use std::collections::HashMap;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Batch, Keys, Store};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in a queue's pending list.
    Queued,
    /// Claimed by a worker and currently executing.
    Running,
    /// Executed successfully; indexed in the finished registry.
    Finished,
    /// Execution failed; indexed in the failed registry.
    Failed,
}

impl TaskStatus {
    /// The string form stored in the task hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "finished" => Some(TaskStatus::Finished),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
///
/// The serde derives cover export and monitoring surfaces; persistence in
/// Redis goes through the hash-field form, not JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// Globally unique, opaque identifier.
    pub id: String,
    /// Opaque work description interpreted by the task handler.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Queue the task was last enqueued to or dequeued from.
    pub queue: Option<String>,
    /// Server timestamp of the last enqueue.
    pub enqueued_at: Option<f64>,
    /// Server timestamp of the last claim by a worker.
    pub started_at: Option<f64>,
    /// Server timestamp of completion (finish or failure).
    pub ended_at: Option<f64>,
    /// Error description if the task failed.
    pub error: Option<String>,
}

impl Task {
    /// Creates a new task with a generated id.
    pub fn new(payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Creates a new task with a caller-supplied id.
    pub fn with_id(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            status: TaskStatus::Queued,
            queue: None,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Stages a full write of this task's record into a batch.
    pub fn stage_save(&self, keys: &Keys, batch: &mut Batch) {
        let mut fields: Vec<(&str, String)> = vec![
            ("payload", self.payload.to_string()),
            ("status", self.status.as_str().to_string()),
        ];
        if let Some(ref queue) = self.queue {
            fields.push(("queue", queue.clone()));
        }
        if let Some(ts) = self.enqueued_at {
            fields.push(("enqueued_at", ts.to_string()));
        }
        if let Some(ts) = self.started_at {
            fields.push(("started_at", ts.to_string()));
        }
        if let Some(ts) = self.ended_at {
            fields.push(("ended_at", ts.to_string()));
        }
        if let Some(ref error) = self.error {
            fields.push(("error", error.clone()));
        }
        batch
            .pipeline()
            .hset_multiple(keys.task(&self.id), &fields)
            .ignore();
    }

    /// Loads a task record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::TaskNotFound` if no record exists for the id.
    pub async fn fetch(store: &Store, id: &str) -> Result<Self, StoreError> {
        let mut conn = store.connection();
        let fields: HashMap<String, String> = conn.hgetall(store.keys().task(id)).await?;
        if fields.is_empty() {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Self::from_fields(id, fields)
    }

    /// Stages deletion of the records for the given task ids.
    pub fn stage_delete_many(keys: &Keys, ids: &[String], batch: &mut Batch) {
        for id in ids {
            batch.pipeline().del(keys.task(id)).ignore();
        }
    }

    fn from_fields(id: &str, fields: HashMap<String, String>) -> Result<Self, StoreError> {
        let corrupt = |reason: &str| StoreError::CorruptTask {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let status = fields
            .get("status")
            .and_then(|s| TaskStatus::parse(s))
            .ok_or_else(|| corrupt("missing or unknown status"))?;

        let payload = match fields.get("payload") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };

        let timestamp = |field: &str| -> Result<Option<f64>, StoreError> {
            fields
                .get(field)
                .map(|raw| raw.parse::<f64>())
                .transpose()
                .map_err(|_| corrupt(&format!("unparseable {field}")))
        };

        Ok(Self {
            id: id.to_string(),
            payload,
            status,
            queue: fields.get("queue").cloned(),
            enqueued_at: timestamp("enqueued_at")?,
            started_at: timestamp("started_at")?,
            ended_at: timestamp("ended_at")?,
            error: fields.get("error").cloned(),
        })
    }
}
