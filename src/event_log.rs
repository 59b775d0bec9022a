//! Append-only event log (spec §3 "Event log record", §6 "Event log").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Closed-ish set of event types; `Custom` covers collaborator-specific events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    CompensationTriggered,
    RollbackInitiated,
    StateUpdated,
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub event_type: EventType,
    pub metadata: HashMap<String, Value>,
}

impl EventRecord {
    pub fn new(workflow_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            task_id: None,
            event_type,
            metadata: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: EventRecord);
    async fn read(&self, workflow_id: &str) -> Vec<EventRecord>;
}

/// In-memory, append-only event log. Append order is a total order per
/// workflow id (spec §5 "Ordering guarantees").
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    records: RwLock<Vec<EventRecord>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: EventRecord) {
        tracing::debug!(
            workflow_id = %event.workflow_id,
            task_id = ?event.task_id,
            event_type = ?event.event_type,
            "event appended"
        );
        self.records.write().push(event);
    }

    async fn read(&self, workflow_id: &str) -> Vec<EventRecord> {
        self.records
            .read()
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect()
    }
}
