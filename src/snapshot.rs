//! Snapshot store: immutable captures of world state and memory pointers,
//! keyed by (workflow, task, attempt) (spec §3 "Snapshot", §6 "Snapshot store").

use crate::error::{KernelError, KernelResult};
use crate::state_store::StateSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub workflow_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub world_state: StateSnapshot,
    pub memory_pointers: HashMap<String, String>,
    pub verified: bool,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create_snapshot(
        &self,
        workflow_id: &str,
        task_id: &str,
        attempt: u32,
        world_state: StateSnapshot,
        memory_pointers: HashMap<String, String>,
        verified: bool,
        metadata: HashMap<String, String>,
    ) -> KernelResult<Snapshot>;

    async fn restore_snapshot(&self, id: Uuid) -> KernelResult<Snapshot>;

    async fn last_verified_snapshot(&self, task_id: &str) -> Option<Snapshot>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<Uuid, Snapshot>,
    /// task id -> ids in creation order, most recent last.
    by_task: DashMap<String, Vec<Uuid>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn create_snapshot(
        &self,
        workflow_id: &str,
        task_id: &str,
        attempt: u32,
        world_state: StateSnapshot,
        memory_pointers: HashMap<String, String>,
        verified: bool,
        metadata: HashMap<String, String>,
    ) -> KernelResult<Snapshot> {
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            attempt,
            world_state,
            memory_pointers,
            verified,
            metadata,
            created_at: Utc::now(),
        };
        self.snapshots.insert(snapshot.id, snapshot.clone());
        self.by_task
            .entry(task_id.to_string())
            .or_default()
            .push(snapshot.id);
        Ok(snapshot)
    }

    async fn restore_snapshot(&self, id: Uuid) -> KernelResult<Snapshot> {
        self.snapshots
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| KernelError::NotFound(format!("snapshot {id}")))
    }

    async fn last_verified_snapshot(&self, task_id: &str) -> Option<Snapshot> {
        let ids = self.by_task.get(task_id)?;
        ids.iter()
            .rev()
            .filter_map(|id| self.snapshots.get(id).map(|s| s.clone()))
            .find(|s| s.verified)
    }
}
