//! Durable side-effect layer: the outbox guarantees exactly-once-observable
//! execution of effectful tool calls across retries and process restarts
//! (spec §4.2, §6 "on-disk layout", §8 scenario 1).

use crate::config::OutboxConfig;
use crate::error::{ErrorCode, KernelError, KernelResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxState {
    Pending,
    Processing,
    Committed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub tool_id: String,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub state: OutboxState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// An executor invoked by the outbox for a pending entry. Boxed so both
/// in-memory and file-backed outboxes can accept arbitrary async closures.
pub type Executor = Box<
    dyn FnOnce(serde_json::Value) -> Pin<Box<dyn Future<Output = KernelResult<serde_json::Value>> + Send>>
        + Send,
>;

/// Outcome of `reconcile`, surfaced to the caller (spec §4.2).
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub reset_to_pending: Vec<String>,
    pub dead_lettered: Vec<String>,
}

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Look up `idempotency_key`; if a `Committed` entry exists, return its
    /// stored result without invoking `executor`. Otherwise create/advance
    /// the entry through `Processing` and run `executor` at most once per
    /// call, committing or marking `Failed`/`DeadLetter` on the outcome.
    async fn execute(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: serde_json::Value,
        idempotency_key: &str,
        executor: Executor,
        max_attempts: u32,
    ) -> KernelResult<serde_json::Value>;

    async fn get(&self, id: &str) -> KernelResult<OutboxEntry>;

    async fn get_by_idempotency_key(&self, key: &str) -> Option<OutboxEntry>;

    /// Scan non-terminal entries and repair ones stuck past the
    /// stuck-processing threshold, optionally auto-retrying failed ones.
    async fn reconcile(
        &self,
        max_age_ms: Option<u64>,
        auto_retry: bool,
        on_dead_letter: Option<&(dyn Fn(&OutboxEntry) + Send + Sync)>,
    ) -> ReconcileReport;

    /// Delete `Committed` entries older than `older_than_ms`.
    async fn cleanup(&self, older_than_ms: u64) -> usize;
}

fn derive_idempotency_key(task_id: &str, attempt: u32, tool_id: &str, params: &serde_json::Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    task_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    tool_id.hash(&mut hasher);
    params.to_string().hash(&mut hasher);
    format!("{task_id}-{attempt}-{tool_id}-{:x}", hasher.finish())
}

/// Deterministic idempotency key derivation (spec §4.1 step 5), exposed so
/// the orchestrator can compute the same key the outbox would derive for a
/// cache check before invoking `execute`.
pub fn idempotency_key_for(task_id: &str, attempt: u32, tool_id: &str, params: &serde_json::Value) -> String {
    derive_idempotency_key(task_id, attempt, tool_id, params)
}

/// In-memory outbox, the default for single-process execution.
#[derive(Debug)]
pub struct InMemoryOutbox {
    entries: DashMap<String, OutboxEntry>,
    by_key: DashMap<String, String>,
    config: OutboxConfig,
}

impl InMemoryOutbox {
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            entries: DashMap::new(),
            by_key: DashMap::new(),
            config,
        }
    }

    pub fn shared(config: OutboxConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn new_entry(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: &serde_json::Value,
        idempotency_key: &str,
        max_attempts: u32,
    ) -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            tool_id: tool_id.to_string(),
            params: params.clone(),
            idempotency_key: idempotency_key.to_string(),
            state: OutboxState::Pending,
            attempts: 0,
            max_attempts,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            committed_at: None,
        }
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn execute(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: serde_json::Value,
        idempotency_key: &str,
        executor: Executor,
        max_attempts: u32,
    ) -> KernelResult<serde_json::Value> {
        let max_attempts = if max_attempts == 0 {
            self.config.default_max_attempts
        } else {
            max_attempts
        };

        let id = match self.by_key.get(idempotency_key) {
            Some(id) => id.clone(),
            None => {
                let entry = self.new_entry(
                    workflow_id,
                    task_id,
                    tool_id,
                    &params,
                    idempotency_key,
                    max_attempts,
                );
                let id = entry.id.clone();
                self.by_key.insert(idempotency_key.to_string(), id.clone());
                self.entries.insert(id.clone(), entry);
                id
            }
        };

        {
            let entry = self
                .entries
                .get(&id)
                .ok_or_else(|| KernelError::NotFound(format!("outbox entry {id}")))?;
            if entry.state == OutboxState::Committed {
                return entry
                    .result
                    .clone()
                    .ok_or_else(|| KernelError::NotFound("committed entry missing result".into()));
            }
            if entry.state == OutboxState::DeadLetter {
                return Err(KernelError::classified(
                    ErrorCode::ToolError,
                    format!("outbox entry {id} is dead-lettered"),
                    Some("inspect and manually replay or discard".into()),
                ));
            }
        }

        {
            let mut entry = self
                .entries
                .get_mut(&id)
                .ok_or_else(|| KernelError::NotFound(format!("outbox entry {id}")))?;
            entry.state = OutboxState::Processing;
            entry.updated_at = Utc::now();
        }

        let outcome = executor(params).await;

        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| KernelError::NotFound(format!("outbox entry {id}")))?;

        match outcome {
            Ok(result) => {
                entry.state = OutboxState::Committed;
                entry.result = Some(result.clone());
                entry.updated_at = Utc::now();
                entry.committed_at = Some(Utc::now());
                Ok(result)
            }
            Err(e) => {
                entry.attempts += 1;
                entry.error = Some(e.to_string());
                entry.updated_at = Utc::now();
                if entry.attempts >= entry.max_attempts {
                    entry.state = OutboxState::DeadLetter;
                } else {
                    entry.state = OutboxState::Failed;
                }
                Err(e)
            }
        }
    }

    async fn get(&self, id: &str) -> KernelResult<OutboxEntry> {
        self.entries
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| KernelError::NotFound(format!("outbox entry {id}")))
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Option<OutboxEntry> {
        let id = self.by_key.get(key)?;
        self.entries.get(id.value()).map(|e| e.clone())
    }

    async fn reconcile(
        &self,
        max_age_ms: Option<u64>,
        auto_retry: bool,
        on_dead_letter: Option<&(dyn Fn(&OutboxEntry) + Send + Sync)>,
    ) -> ReconcileReport {
        let threshold_ms = max_age_ms.unwrap_or(self.config.stuck_processing_threshold_ms);
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let mut entry = match self.entries.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            match entry.state {
                OutboxState::Processing => {
                    let age_ms = (now - entry.updated_at).num_milliseconds().max(0) as u64;
                    if age_ms > threshold_ms {
                        entry.state = OutboxState::Pending;
                        entry.updated_at = now;
                        report.reset_to_pending.push(id.clone());
                    }
                }
                OutboxState::Failed if auto_retry && entry.attempts < entry.max_attempts => {
                    entry.state = OutboxState::Pending;
                    entry.updated_at = now;
                    report.reset_to_pending.push(id.clone());
                }
                OutboxState::DeadLetter => {
                    if let Some(cb) = on_dead_letter {
                        cb(&entry);
                    }
                    report.dead_lettered.push(id.clone());
                }
                _ => {}
            }
        }
        report
    }

    async fn cleanup(&self, older_than_ms: u64) -> usize {
        let now = Utc::now();
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                e.state == OutboxState::Committed
                    && e.committed_at
                        .map(|t| (now - t).num_milliseconds().max(0) as u64 > older_than_ms)
                        .unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &ids {
            if let Some((_, entry)) = self.entries.remove(id) {
                self.by_key.remove(&entry.idempotency_key);
            }
        }
        ids.len()
    }
}

/// File-backed outbox store, following the on-disk layout normative for
/// bit-compatible re-implementations (spec §6):
/// `<baseDir>/<workflowId>/<entryId>.json`, plus rebuildable indices under
/// `<baseDir>/_index/`.
pub struct FileOutbox {
    base_dir: PathBuf,
    config: OutboxConfig,
    by_id: DashMap<String, String>,
    by_key: DashMap<String, String>,
}

impl FileOutbox {
    pub async fn open(base_dir: PathBuf, config: OutboxConfig) -> KernelResult<Self> {
        tokio::fs::create_dir_all(&base_dir).await?;
        tokio::fs::create_dir_all(base_dir.join("_index")).await?;

        let outbox = Self {
            base_dir,
            config,
            by_id: DashMap::new(),
            by_key: DashMap::new(),
        };
        outbox.rebuild_indices().await?;
        Ok(outbox)
    }

    fn entry_path(&self, workflow_id: &str, entry_id: &str) -> PathBuf {
        self.base_dir.join(workflow_id).join(format!("{entry_id}.json"))
    }

    /// Indices may be rebuilt by scanning entry files; used both at `open`
    /// and as fallback recovery when an index lookup misses (spec §6, and
    /// the resolved Open Question on `get`'s index-miss behaviour in
    /// SPEC_FULL.md §3).
    async fn rebuild_indices(&self) -> KernelResult<()> {
        self.by_id.clear();
        self.by_key.clear();

        let mut workflows = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(wf_dir) = workflows.next_entry().await? {
            if !wf_dir.file_type().await?.is_dir() || wf_dir.file_name() == "_index" {
                continue;
            }
            let mut files = tokio::fs::read_dir(wf_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(file.path()).await?;
                let entry: OutboxEntry = serde_json::from_slice(&bytes)?;
                self.by_id.insert(entry.id.clone(), entry.workflow_id.clone());
                self.by_key.insert(entry.idempotency_key.clone(), entry.id.clone());
            }
        }
        Ok(())
    }

    async fn write_entry(&self, entry: &OutboxEntry) -> KernelResult<()> {
        let dir = self.base_dir.join(&entry.workflow_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.entry_path(&entry.workflow_id, &entry.id);
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(path, bytes).await?;
        self.by_id.insert(entry.id.clone(), entry.workflow_id.clone());
        self.by_key.insert(entry.idempotency_key.clone(), entry.id.clone());
        Ok(())
    }

    async fn read_entry(&self, workflow_id: &str, entry_id: &str) -> KernelResult<OutboxEntry> {
        let bytes = tokio::fs::read(self.entry_path(workflow_id, entry_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl Outbox for FileOutbox {
    async fn execute(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: serde_json::Value,
        idempotency_key: &str,
        executor: Executor,
        max_attempts: u32,
    ) -> KernelResult<serde_json::Value> {
        let max_attempts = if max_attempts == 0 {
            self.config.default_max_attempts
        } else {
            max_attempts
        };

        let existing_id = self.by_key.get(idempotency_key).map(|r| r.clone());
        let mut entry = match existing_id {
            Some(id) => {
                let wf = self
                    .by_id
                    .get(&id)
                    .map(|w| w.clone())
                    .unwrap_or_else(|| workflow_id.to_string());
                self.read_entry(&wf, &id).await?
            }
            None => {
                let now = Utc::now();
                OutboxEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    workflow_id: workflow_id.to_string(),
                    task_id: task_id.to_string(),
                    tool_id: tool_id.to_string(),
                    params: params.clone(),
                    idempotency_key: idempotency_key.to_string(),
                    state: OutboxState::Pending,
                    attempts: 0,
                    max_attempts,
                    result: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                    committed_at: None,
                }
            }
        };

        if entry.state == OutboxState::Committed {
            return entry
                .result
                .clone()
                .ok_or_else(|| KernelError::NotFound("committed entry missing result".into()));
        }
        if entry.state == OutboxState::DeadLetter {
            return Err(KernelError::classified(
                ErrorCode::ToolError,
                format!("outbox entry {} is dead-lettered", entry.id),
                Some("inspect and manually replay or discard".into()),
            ));
        }

        entry.state = OutboxState::Processing;
        entry.updated_at = Utc::now();
        self.write_entry(&entry).await?;

        let outcome = executor(params).await;

        match outcome {
            Ok(result) => {
                entry.state = OutboxState::Committed;
                entry.result = Some(result.clone());
                entry.updated_at = Utc::now();
                entry.committed_at = Some(Utc::now());
                self.write_entry(&entry).await?;
                Ok(result)
            }
            Err(e) => {
                entry.attempts += 1;
                entry.error = Some(e.to_string());
                entry.updated_at = Utc::now();
                entry.state = if entry.attempts >= entry.max_attempts {
                    OutboxState::DeadLetter
                } else {
                    OutboxState::Failed
                };
                self.write_entry(&entry).await?;
                Err(e)
            }
        }
    }

    async fn get(&self, id: &str) -> KernelResult<OutboxEntry> {
        if let Some(wf) = self.by_id.get(id) {
            if let Ok(entry) = self.read_entry(&wf, id).await {
                return Ok(entry);
            }
        }
        // Index miss: rebuild from disk rather than returning `None`
        // (spec §9 Open Question, resolved in SPEC_FULL.md §3).
        self.rebuild_indices().await?;
        let wf = self
            .by_id
            .get(id)
            .map(|w| w.clone())
            .ok_or_else(|| KernelError::NotFound(format!("outbox entry {id}")))?;
        self.read_entry(&wf, id).await
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Option<OutboxEntry> {
        let id = self.by_key.get(key).map(|r| r.clone())?;
        self.get(&id).await.ok()
    }

    async fn reconcile(
        &self,
        max_age_ms: Option<u64>,
        auto_retry: bool,
        on_dead_letter: Option<&(dyn Fn(&OutboxEntry) + Send + Sync)>,
    ) -> ReconcileReport {
        let threshold_ms = max_age_ms.unwrap_or(self.config.stuck_processing_threshold_ms);
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let ids: Vec<(String, String)> = self
            .by_id
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (id, wf) in ids {
            let mut entry = match self.read_entry(&wf, &id).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            match entry.state {
                OutboxState::Processing => {
                    let age_ms = (now - entry.updated_at).num_milliseconds().max(0) as u64;
                    if age_ms > threshold_ms {
                        entry.state = OutboxState::Pending;
                        entry.updated_at = now;
                        if self.write_entry(&entry).await.is_ok() {
                            report.reset_to_pending.push(id);
                        }
                    }
                }
                OutboxState::Failed if auto_retry && entry.attempts < entry.max_attempts => {
                    entry.state = OutboxState::Pending;
                    entry.updated_at = now;
                    if self.write_entry(&entry).await.is_ok() {
                        report.reset_to_pending.push(id);
                    }
                }
                OutboxState::DeadLetter => {
                    if let Some(cb) = on_dead_letter {
                        cb(&entry);
                    }
                    report.dead_lettered.push(id);
                }
                _ => {}
            }
        }
        report
    }

    async fn cleanup(&self, older_than_ms: u64) -> usize {
        let now = Utc::now();
        let ids: Vec<(String, String)> = self
            .by_id
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut removed = 0;
        for (id, wf) in ids {
            if let Ok(entry) = self.read_entry(&wf, &id).await {
                let stale = entry.state == OutboxState::Committed
                    && entry
                        .committed_at
                        .map(|t| (now - t).num_milliseconds().max(0) as u64 > older_than_ms)
                        .unwrap_or(false);
                if stale {
                    let _ = tokio::fs::remove_file(self.entry_path(&wf, &id)).await;
                    self.by_id.remove(&id);
                    self.by_key.remove(&entry.idempotency_key);
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// A no-op wrapper that tracks how many times the inner closure actually
/// ran, for tests asserting "executor runs at most once".
pub fn counting_executor(
    counter: Arc<std::sync::atomic::AtomicU32>,
    attempts_to_fail: u32,
    result: serde_json::Value,
) -> impl Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = KernelResult<serde_json::Value>> + Send>> {
    move |_params| {
        let counter = counter.clone();
        let result = result.clone();
        Box::pin(async move {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < attempts_to_fail {
                Err(KernelError::classified(
                    ErrorCode::ToolError,
                    "transient failure",
                    None,
                ))
            } else {
                Ok(result)
            }
        })
    }
}
