//! Multi-agent coordinator: resource locking, wait-for graph, and deadlock
//! detection (spec §4.4, §3 "Resource lock" / "Wait-for edge").

use crate::config::CoordinatorConfig;
use crate::error::{KernelError, KernelResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Access mode for a resource lock (spec §3 "Resource lock").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Per-resource coordination policy (spec §4.4 "Coordination policies").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinationPolicy {
    /// One writer, no other holders of any mode.
    Exclusive,
    /// Many readers; writes exclusive; optional concurrency cap.
    Shared { max_concurrent: Option<usize> },
    /// Agents acquire strictly in the declared order.
    Ordered { agent_order: Vec<String> },
    /// Higher-priority agents preempt waiters on release.
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub holder: String,
    pub workflow_id: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

fn is_compatible(held: LockMode, requested: LockMode) -> bool {
    matches!((held, requested), (LockMode::Read, LockMode::Read))
}

/// Wait-for graph: directed edges agent -> agent it is blocked on.
#[derive(Debug, Default)]
struct WaitForGraph {
    edges: HashMap<String, HashSet<String>>,
    reverse_edges: HashMap<String, HashSet<String>>,
}

impl WaitForGraph {
    fn add_edge(&mut self, waiter: String, holder: String) {
        self.edges.entry(waiter.clone()).or_default().insert(holder.clone());
        self.reverse_edges.entry(holder).or_default().insert(waiter);
    }

    fn remove_edge(&mut self, waiter: &str, holder: &str) {
        if let Some(holders) = self.edges.get_mut(waiter) {
            holders.remove(holder);
            if holders.is_empty() {
                self.edges.remove(waiter);
            }
        }
        if let Some(waiters) = self.reverse_edges.get_mut(holder) {
            waiters.remove(waiter);
            if waiters.is_empty() {
                self.reverse_edges.remove(holder);
            }
        }
    }

    /// Remove all edges where `agent` is either waiter or holder.
    fn remove_agent(&mut self, agent: &str) {
        if let Some(holders) = self.edges.remove(agent) {
            for holder in holders {
                if let Some(waiters) = self.reverse_edges.get_mut(&holder) {
                    waiters.remove(agent);
                }
            }
        }
        if let Some(waiters) = self.reverse_edges.remove(agent) {
            for waiter in waiters {
                if let Some(holders) = self.edges.get_mut(&waiter) {
                    holders.remove(agent);
                }
            }
        }
    }

    /// DFS cycle detection; returns the first cycle found, as the sequence
    /// of agent ids composing it.
    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for agent in self.edges.keys() {
            if !visited.contains(agent) {
                if let Some(cycle) = self.dfs(agent, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs(
        &self,
        agent: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(agent.to_string());
        rec_stack.insert(agent.to_string());
        path.push(agent.to_string());

        if let Some(neighbors) = self.edges.get(agent) {
            for neighbor in neighbors {
                if !visited.contains(neighbor) {
                    if let Some(cycle) = self.dfs(neighbor, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(neighbor) {
                    let start = path.iter().position(|a| a == neighbor).unwrap();
                    return Some(path[start..].to_vec());
                }
            }
        }

        rec_stack.remove(agent);
        path.pop();
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockReport {
    pub cycle: Vec<String>,
    pub affected_resources: Vec<String>,
}

/// Mediates access to shared resources across concurrently executing tasks.
pub struct Coordinator {
    locks: DashMap<String, Vec<ResourceLock>>,
    policies: DashMap<String, CoordinationPolicy>,
    wait_graph: RwLock<WaitForGraph>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            locks: DashMap::new(),
            policies: DashMap::new(),
            wait_graph: RwLock::new(WaitForGraph::default()),
            config,
        }
    }

    pub fn shared(config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn register_policy(&self, resource_id: impl Into<String>, policy: CoordinationPolicy) {
        self.policies.insert(resource_id.into(), policy);
    }

    fn policy_for(&self, resource_id: &str) -> CoordinationPolicy {
        self.policies
            .get(resource_id)
            .map(|p| p.clone())
            .unwrap_or(CoordinationPolicy::Exclusive)
    }

    fn holders_compatible(
        &self,
        resource_id: &str,
        agent: &str,
        mode: LockMode,
    ) -> Result<(), String> {
        let policy = self.policy_for(resource_id);
        let current = self.locks.get(resource_id);
        let others: Vec<&ResourceLock> = current
            .as_ref()
            .map(|v| v.iter().filter(|l| l.holder != agent).collect())
            .unwrap_or_default();

        if others.is_empty() {
            return Ok(());
        }

        match policy {
            CoordinationPolicy::Exclusive => {
                Err(others[0].holder.clone())
            }
            CoordinationPolicy::Shared { max_concurrent } => {
                if mode == LockMode::Write || others.iter().any(|l| l.mode == LockMode::Write) {
                    return Err(others[0].holder.clone());
                }
                if let Some(max) = max_concurrent {
                    if others.len() >= max {
                        return Err(others[0].holder.clone());
                    }
                }
                Ok(())
            }
            CoordinationPolicy::Ordered { agent_order } => {
                let agent_rank = agent_order.iter().position(|a| a == agent);
                let blocked_by = others.iter().find(|l| {
                    let holder_rank = agent_order.iter().position(|a| a == &l.holder);
                    match (agent_rank, holder_rank) {
                        (Some(ar), Some(hr)) => hr < ar,
                        _ => !is_compatible(l.mode, mode),
                    }
                });
                match blocked_by {
                    Some(l) => Err(l.holder.clone()),
                    None if others.iter().all(|l| is_compatible(l.mode, mode)) => Ok(()),
                    None => Err(others[0].holder.clone()),
                }
            }
            CoordinationPolicy::Priority => {
                if others.iter().all(|l| is_compatible(l.mode, mode)) {
                    Ok(())
                } else {
                    Err(others[0].holder.clone())
                }
            }
        }
    }

    /// Attempt to acquire `resource_id` for `agent`, retrying until the
    /// configured timeout elapses. Registers/clears wait-for edges around
    /// each attempt (spec §4.4 "acquireLock").
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        agent: &str,
        workflow_id: &str,
        mode: LockMode,
    ) -> KernelResult<bool> {
        self.sweep_expired();

        let deadline = Utc::now() + ChronoDuration::milliseconds(self.config.default_lock_timeout_ms as i64);
        loop {
            match self.holders_compatible(resource_id, agent, mode) {
                Ok(()) => {
                    self.wait_graph.write().remove_agent(agent);
                    let now = Utc::now();
                    let lock = ResourceLock {
                        resource_id: resource_id.to_string(),
                        holder: agent.to_string(),
                        workflow_id: workflow_id.to_string(),
                        mode,
                        acquired_at: now,
                        expires_at: now + ChronoDuration::milliseconds(self.config.default_lock_timeout_ms as i64),
                    };
                    self.locks.entry(resource_id.to_string()).or_default().push(lock);
                    return Ok(true);
                }
                Err(blocking_holder) => {
                    self.wait_graph.write().add_edge(agent.to_string(), blocking_holder.clone());

                    // Deadlock resolution belongs to `detect_deadlock`/`Mitigator`, not to
                    // the waiter itself: self-aborting here would remove the cycle's edge
                    // before an external caller ever observes it (spec §4.4 splits
                    // detection and mitigation out from `acquireLock`).
                    if Utc::now() >= deadline {
                        self.wait_graph.write().remove_edge(agent, &blocking_holder);
                        return Err(KernelError::LockTimeout {
                            resource: resource_id.to_string(),
                        });
                    }

                    tokio::time::sleep(Duration::from_millis(25)).await;
                    self.sweep_expired();
                }
            }
        }
    }

    /// Release `agent`'s lock on `resource_id`, removing its wait-for edges.
    pub fn release_lock(&self, resource_id: &str, agent: &str) {
        if let Some(mut locks) = self.locks.get_mut(resource_id) {
            locks.retain(|l| l.holder != agent);
        }
        self.wait_graph.write().remove_agent(agent);
    }

    /// Release every lock `agent` currently holds across all resources.
    pub fn release_all(&self, agent: &str) {
        for mut entry in self.locks.iter_mut() {
            entry.retain(|l| l.holder != agent);
        }
        self.wait_graph.write().remove_agent(agent);
    }

    pub fn detect_deadlock(&self) -> Option<DeadlockReport> {
        let cycle = self.wait_graph.read().detect_cycle()?;
        let cycle_set: HashSet<&String> = cycle.iter().collect();
        let affected_resources: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().iter().any(|l| cycle_set.contains(&l.holder)))
            .map(|entry| entry.key().clone())
            .collect();

        Some(DeadlockReport { cycle, affected_resources })
    }

    /// Resources currently held by `agent`, used by the mitigator to pick
    /// deadlock victims by resource count (spec §4.4 "Mitigator").
    pub fn resources_held_by(&self, agent: &str) -> Vec<String> {
        self.locks
            .iter()
            .filter(|e| e.value().iter().any(|l| l.holder == agent))
            .map(|e| e.key().clone())
            .collect()
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut emptied = Vec::new();
        for mut entry in self.locks.iter_mut() {
            let before = entry.len();
            entry.retain(|l| !l.is_expired(now));
            if entry.len() != before {
                tracing::debug!(resource = %entry.key(), "released expired locks");
            }
            if entry.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.locks.remove(&key);
        }
    }

    /// Background timeout sweeper (spec §4.4), intended to run on an
    /// interval while `enableTimeoutChecker` is set.
    pub async fn run_timeout_sweeper(self: Arc<Self>, interval: Duration) {
        if !self.config.enable_timeout_checker {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_policy_blocks_second_writer() {
        let coordinator = Coordinator::new(CoordinatorConfig {
            default_lock_timeout_ms: 100,
            enable_timeout_checker: false,
        });

        assert!(coordinator
            .acquire_lock("res1", "agent-a", "wf1", LockMode::Write)
            .await
            .unwrap());

        let result = coordinator.acquire_lock("res1", "agent-b", "wf1", LockMode::Write).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn release_unblocks_waiter() {
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
            default_lock_timeout_ms: 2_000,
            enable_timeout_checker: false,
        }));

        coordinator.acquire_lock("res1", "agent-a", "wf1", LockMode::Write).await.unwrap();

        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move {
            waiter.acquire_lock("res1", "agent-b", "wf1", LockMode::Write).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.release_lock("res1", "agent-a");

        let result = handle.await.unwrap();
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn shared_policy_allows_concurrent_reads() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.register_policy("res1", CoordinationPolicy::Shared { max_concurrent: None });

        assert!(coordinator.acquire_lock("res1", "agent-a", "wf1", LockMode::Read).await.unwrap());
        assert!(coordinator.acquire_lock("res1", "agent-b", "wf1", LockMode::Read).await.unwrap());
    }

    #[tokio::test]
    async fn detects_two_agent_deadlock_cycle() {
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
            default_lock_timeout_ms: 5_000,
            enable_timeout_checker: false,
        }));

        coordinator.acquire_lock("res1", "agent-a", "wf1", LockMode::Write).await.unwrap();
        coordinator.acquire_lock("res2", "agent-b", "wf1", LockMode::Write).await.unwrap();

        let c1 = coordinator.clone();
        let h1 = tokio::spawn(async move { c1.acquire_lock("res2", "agent-a", "wf1", LockMode::Write).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let c2 = coordinator.clone();
        let h2 = tokio::spawn(async move { c2.acquire_lock("res1", "agent-b", "wf1", LockMode::Write).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = coordinator.detect_deadlock().expect("waiting agents must still form a cycle");
        let mut cycle = report.cycle.clone();
        cycle.sort();
        assert_eq!(cycle, vec!["agent-a".to_string(), "agent-b".to_string()]);

        coordinator.release_lock("res1", "agent-a");

        let (r1, r2) = tokio::join!(h1, h2);
        let one_succeeded = r1.unwrap().unwrap_or(false) || r2.unwrap().unwrap_or(false);
        assert!(one_succeeded, "releasing the victim's lock must let the other waiter proceed");
    }

    #[tokio::test]
    async fn unresolved_deadlock_times_out_both_waiters() {
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
            default_lock_timeout_ms: 150,
            enable_timeout_checker: false,
        }));

        coordinator.acquire_lock("res1", "agent-a", "wf1", LockMode::Write).await.unwrap();
        coordinator.acquire_lock("res2", "agent-b", "wf1", LockMode::Write).await.unwrap();

        let c1 = coordinator.clone();
        let h1 = tokio::spawn(async move { c1.acquire_lock("res2", "agent-a", "wf1", LockMode::Write).await });
        let c2 = coordinator.clone();
        let h2 = tokio::spawn(async move { c2.acquire_lock("res1", "agent-b", "wf1", LockMode::Write).await });

        let (r1, r2) = tokio::join!(h1, h2);
        assert!(r1.unwrap().is_err());
        assert!(r2.unwrap().is_err());
    }
}
