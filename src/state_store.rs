//! World-state store: a versioned key/value store with optimistic
//! concurrency control (spec §3 "State entry", §6 "State store (world-state)").

use crate::error::{ErrorCode, KernelError, KernelResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A single versioned entry in the world-state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub metadata: HashMap<String, String>,
}

/// An immutable point-in-time capture of the whole store, used by the
/// snapshot/rollback machinery (spec §4.1 "Rollback").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    pub entries: HashMap<String, StateEntry>,
}

/// The world-state store contract (spec §6).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create(
        &self,
        key: &str,
        value: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> KernelResult<StateEntry>;

    async fn read(&self, key: &str) -> KernelResult<StateEntry>;

    /// Compare-and-swap update: fails with `ErrorCode::Conflict` if
    /// `expected_version` does not match the entry's current version.
    async fn update(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
        metadata: Option<HashMap<String, String>>,
    ) -> KernelResult<StateEntry>;

    async fn delete(&self, key: &str, expected_version: u64) -> KernelResult<()>;

    async fn keys(&self) -> Vec<String>;

    async fn snapshot(&self) -> StateSnapshot;

    /// Reconcile the store to match `target` exactly, value and version
    /// alike: keys absent from `target` are deleted, keys present are
    /// overwritten wholesale with the snapshot's entry (spec §8 "values and
    /// versions reconciled to S"). This bypasses compare-and-swap — rollback
    /// is a privileged operation restoring a prior verified state, not a
    /// concurrent writer racing the current version.
    async fn reconcile_to(&self, target: &StateSnapshot) -> KernelResult<()>;
}

/// In-memory implementation backed by a `DashMap`, matching the
/// concurrent-map idiom the teacher crate already depends on.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: DashMap<String, StateEntry>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(
        &self,
        key: &str,
        value: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> KernelResult<StateEntry> {
        let entry = StateEntry {
            key: key.to_string(),
            value,
            version: 1,
            metadata,
        };
        self.entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn read(&self, key: &str) -> KernelResult<StateEntry> {
        self.entries
            .get(key)
            .map(|e| e.clone())
            .ok_or_else(|| KernelError::NotFound(key.to_string()))
    }

    async fn update(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
        metadata: Option<HashMap<String, String>>,
    ) -> KernelResult<StateEntry> {
        let mut slot = self
            .entries
            .get_mut(key)
            .ok_or_else(|| KernelError::NotFound(key.to_string()))?;

        if slot.version != expected_version {
            return Err(KernelError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: slot.version,
            });
        }

        slot.value = value;
        slot.version += 1;
        if let Some(m) = metadata {
            slot.metadata = m;
        }
        Ok(slot.clone())
    }

    async fn delete(&self, key: &str, expected_version: u64) -> KernelResult<()> {
        let current = self
            .entries
            .get(key)
            .ok_or_else(|| KernelError::NotFound(key.to_string()))?
            .version;
        if current != expected_version {
            return Err(KernelError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: current,
            });
        }
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    async fn reconcile_to(&self, target: &StateSnapshot) -> KernelResult<()> {
        let current_keys: Vec<String> = self.keys().await;

        for key in current_keys {
            if !target.entries.contains_key(&key) {
                self.entries.remove(&key);
            }
        }

        for (key, snapshot_entry) in &target.entries {
            self.entries.insert(key.clone(), snapshot_entry.clone());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_update_rejects_stale_version() {
        let store = InMemoryStateStore::new();
        let entry = store
            .create("acct1", serde_json::json!({"bal": 1000}), HashMap::new())
            .await
            .unwrap();
        assert_eq!(entry.version, 1);

        let err = store
            .update("acct1", serde_json::json!({"bal": 900}), 99, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let updated = store
            .update("acct1", serde_json::json!({"bal": 900}), 1, None)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn rollback_restores_snapshot_exactly() {
        let store = InMemoryStateStore::new();
        store
            .create("acct1", serde_json::json!({"bal": 1000}), HashMap::new())
            .await
            .unwrap();
        store
            .create("acct2", serde_json::json!({"bal": 500}), HashMap::new())
            .await
            .unwrap();

        let snapshot = store.snapshot().await;

        store.update("acct1", serde_json::json!({"bal": 900}), 1, None).await.unwrap();
        store.update("acct2", serde_json::json!({"bal": 600}), 1, None).await.unwrap();
        store
            .create("acct3", serde_json::json!({"bal": 1}), HashMap::new())
            .await
            .unwrap();

        store.reconcile_to(&snapshot).await.unwrap();

        assert_eq!(store.read("acct1").await.unwrap().value, serde_json::json!({"bal": 1000}));
        assert_eq!(store.read("acct2").await.unwrap().value, serde_json::json!({"bal": 500}));
        assert!(store.read("acct3").await.is_err());
    }

    #[tokio::test]
    async fn reconcile_to_restores_versions_not_just_values() {
        let store = InMemoryStateStore::new();
        store.create("acct1", serde_json::json!({"bal": 1000}), HashMap::new()).await.unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.entries["acct1"].version, 1);

        store.update("acct1", serde_json::json!({"bal": 900}), 1, None).await.unwrap();
        store.update("acct1", serde_json::json!({"bal": 800}), 2, None).await.unwrap();
        assert_eq!(store.read("acct1").await.unwrap().version, 3);

        store.reconcile_to(&snapshot).await.unwrap();

        let restored = store.read("acct1").await.unwrap();
        assert_eq!(restored.value, serde_json::json!({"bal": 1000}));
        assert_eq!(restored.version, 1, "version must be reconciled to the snapshot's, not left incremented");
    }
}
