//! Spawned units of work and their pollable status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

use crate::entities::TenantId;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(TaskId)
            .map_err(|e| SyncError::InvalidInput(format!("invalid task id {:?}: {}", s, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded { result: serde_json::Value },
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded { .. } | TaskStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub tenant_id: Option<TenantId>,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handle to a spawned task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    join: JoinHandle<TaskStatus>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the terminal status
    pub async fn wait(self) -> TaskStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => TaskStatus::Failed {
                error: format!("task aborted: {}", e),
            },
        }
    }
}

/// Status of every task spawned through it. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as pending, then run `work` on the runtime.
    pub fn spawn<F>(&self, name: &str, tenant_id: Option<TenantId>, work: F) -> TaskHandle
    where
        F: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let id = TaskId::new();
        let now = Utc::now();
        self.write().insert(
            id,
            TaskRecord {
                id,
                name: name.to_string(),
                tenant_id,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );

        let registry = self.clone();
        let join = tokio::spawn(async move {
            let mut unfinished = Unfinished {
                registry,
                id,
                armed: true,
            };
            unfinished.registry.set_status(id, TaskStatus::Running);

            let status = match work.await {
                Ok(result) => TaskStatus::Succeeded { result },
                Err(error) => TaskStatus::Failed { error },
            };

            unfinished.armed = false;
            unfinished.registry.set_status(id, status.clone());
            status
        });

        TaskHandle { id, join }
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.read().get(id).map(|record| record.status.clone())
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.read().get(id).cloned()
    }

    /// Most recent first
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drop finished tasks last updated before `cutoff`. Returns how many.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, record| !(record.status.is_terminal() && record.updated_at < cutoff));
        before - tasks.len()
    }

    fn set_status(&self, id: TaskId, status: TaskStatus) {
        match self.write().get_mut(&id) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
            }
            None => error!(task_id = %id, "status update for unknown task"),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Records `Failed` if the task body unwinds or is aborted before finishing
struct Unfinished {
    registry: TaskRegistry,
    id: TaskId,
    armed: bool,
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = if std::thread::panicking() {
            "task panicked"
        } else {
            "task cancelled"
        };
        error!(task_id = %self.id, error, "task ended without a result");
        self.registry.set_status(
            self.id,
            TaskStatus::Failed {
                error: error.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_spawn_reports_success() {
        let registry = TaskRegistry::new();
        let handle = registry.spawn("demo", None, async { Ok(json!({"count": 3})) });
        let id = handle.id();

        let status = handle.wait().await;

        assert_eq!(status, TaskStatus::Succeeded { result: json!({"count": 3}) });
        assert_eq!(registry.status(&id), Some(status));
    }

    #[tokio::test]
    async fn test_spawn_reports_failure() {
        let registry = TaskRegistry::new();
        let tenant = TenantId::new();
        let handle = registry.spawn("demo", Some(tenant), async { Err("boom".to_string()) });
        let id = handle.id();

        handle.wait().await;

        let record = registry.get(&id).unwrap();
        assert_eq!(record.tenant_id, Some(tenant));
        assert_eq!(record.status, TaskStatus::Failed { error: "boom".into() });
    }

    #[tokio::test]
    async fn test_prune_keeps_unfinished() {
        let registry = TaskRegistry::new();
        registry.spawn("done", None, async { Ok(json!(null)) }).wait().await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let pending = registry.spawn("waiting", None, async move {
            let _ = rx.await;
            Ok(json!(null))
        });

        let pruned = registry.prune_finished(Utc::now() + chrono::Duration::seconds(1));

        assert_eq!(pruned, 1);
        assert!(registry.status(&pending.id()).is_some());
        let _ = tx.send(());
        pending.wait().await;
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded_as_failed() {
        let registry = TaskRegistry::new();
        let handle = registry.spawn("explodes", None, async {
            let blow_up = true;
            if blow_up {
                panic!("work blew up");
            }
            Ok(json!(null))
        });
        let id = handle.id();

        let status = handle.wait().await;

        assert!(matches!(status, TaskStatus::Failed { .. }));
        let recorded = registry.status(&id).unwrap();
        assert_eq!(recorded, TaskStatus::Failed { error: "task panicked".into() });
        assert_eq!(registry.prune_finished(Utc::now() + chrono::Duration::seconds(1)), 1);
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("nope".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(TaskStatus::Failed { error: "x".into() }).unwrap();
        assert_eq!(json, json!({"status": "failed", "error": "x"}));
    }
}
