//! Livelock detector: recognises agents stuck cycling through states
//! without making progress (spec §3 "Agent state record", §4.4 "Livelock
//! detector").

use crate::config::LivelockConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivelockPattern {
    Alternating,
    Cyclic { period: usize },
    NoProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivelockReport {
    pub agent_id: String,
    pub pattern: LivelockPattern,
}

#[derive(Debug, Clone)]
struct StateSample {
    hash: u64,
    recorded_at: DateTime<Utc>,
}

/// Per-agent bounded ring buffer of recent state hashes.
#[derive(Debug)]
struct AgentStateRecord {
    workflow_id: String,
    task_id: String,
    samples: VecDeque<StateSample>,
    window_size: usize,
}

impl AgentStateRecord {
    fn new(workflow_id: String, task_id: String, window_size: usize) -> Self {
        Self {
            workflow_id,
            task_id,
            samples: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn push(&mut self, hash: u64) {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(StateSample { hash, recorded_at: Utc::now() });
    }
}

/// Records agent state hashes on every scheduler tick and detects recurring
/// no-progress patterns.
pub struct LivelockDetector {
    records: DashMap<String, AgentStateRecord>,
    config: LivelockConfig,
}

impl LivelockDetector {
    pub fn new(config: LivelockConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    /// Record one state observation for `agent_id` and check for a
    /// livelock pattern in its recent history.
    pub fn record(
        &self,
        agent_id: &str,
        workflow_id: &str,
        task_id: &str,
        state_hash: u64,
    ) -> Option<LivelockReport> {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                AgentStateRecord::new(workflow_id.to_string(), task_id.to_string(), self.config.window_size)
            });
        record.push(state_hash);

        self.detect_pattern(agent_id, &record)
    }

    fn detect_pattern(&self, agent_id: &str, record: &AgentStateRecord) -> Option<LivelockReport> {
        if let Some(pattern) = self.detect_no_progress(record) {
            return Some(LivelockReport { agent_id: agent_id.to_string(), pattern });
        }
        if let Some(pattern) = self.detect_alternating(record) {
            return Some(LivelockReport { agent_id: agent_id.to_string(), pattern });
        }
        if let Some(pattern) = self.detect_cyclic(record) {
            return Some(LivelockReport { agent_id: agent_id.to_string(), pattern });
        }
        None
    }

    fn detect_no_progress(&self, record: &AgentStateRecord) -> Option<LivelockPattern> {
        let first = record.samples.front()?;
        if record.samples.iter().all(|s| s.hash == first.hash) {
            let elapsed = Utc::now()
                .signed_duration_since(first.recorded_at)
                .num_milliseconds()
                .max(0) as u64;
            if elapsed >= self.config.progress_timeout_ms {
                return Some(LivelockPattern::NoProgress);
            }
        }
        None
    }

    /// ABAB... alternation over at least `pattern_threshold` full cycles.
    fn detect_alternating(&self, record: &AgentStateRecord) -> Option<LivelockPattern> {
        let hashes: Vec<u64> = record.samples.iter().map(|s| s.hash).collect();
        let needed = self.config.pattern_threshold * 2;
        if hashes.len() < needed {
            return None;
        }
        let tail = &hashes[hashes.len() - needed..];
        let (a, b) = (tail[0], tail[1]);
        if a == b {
            return None;
        }
        let alternates = tail.chunks(2).all(|pair| pair == [a, b] || pair == [b, a]);
        if alternates {
            Some(LivelockPattern::Alternating)
        } else {
            None
        }
    }

    /// A repeating block of period `p < window_size`, repeated at least
    /// `pattern_threshold` times within the window.
    fn detect_cyclic(&self, record: &AgentStateRecord) -> Option<LivelockPattern> {
        let hashes: Vec<u64> = record.samples.iter().map(|s| s.hash).collect();
        let n = hashes.len();
        if n < self.config.pattern_threshold * 2 {
            return None;
        }

        for period in 1..n / self.config.pattern_threshold.max(1) {
            let repeats = n / period;
            if repeats < self.config.pattern_threshold {
                continue;
            }
            let window = repeats * period;
            let slice = &hashes[n - window..];
            let base = &slice[..period];
            let is_cyclic = slice.chunks(period).all(|chunk| chunk == base);
            if is_cyclic && base.iter().collect::<std::collections::HashSet<_>>().len() > 1 {
                return Some(LivelockPattern::Cyclic { period });
            }
        }
        None
    }

    /// Re-check an agent's existing history for a livelock pattern without
    /// recording a new sample, used by the mitigator's sweep.
    pub fn check(&self, agent_id: &str) -> Option<LivelockReport> {
        let record = self.records.get(agent_id)?;
        self.detect_pattern(agent_id, &record)
    }

    /// Clear an agent's recorded history, used after mitigation.
    pub fn clear(&self, agent_id: &str) {
        self.records.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_alternating_pattern() {
        let detector = LivelockDetector::new(LivelockConfig {
            window_size: 10,
            pattern_threshold: 3,
            progress_timeout_ms: 60_000,
        });

        let mut report = None;
        for i in 0..8 {
            let hash = if i % 2 == 0 { 1 } else { 2 };
            report = detector.record("agent-a", "wf1", "t1", hash);
        }
        assert!(matches!(report, Some(LivelockReport { pattern: LivelockPattern::Alternating, .. })));
    }

    #[test]
    fn detects_cyclic_pattern() {
        let detector = LivelockDetector::new(LivelockConfig {
            window_size: 12,
            pattern_threshold: 3,
            progress_timeout_ms: 60_000,
        });

        let cycle = [1u64, 2, 3];
        let mut report = None;
        for i in 0..9 {
            report = detector.record("agent-a", "wf1", "t1", cycle[i % cycle.len()]);
        }
        assert!(matches!(report, Some(LivelockReport { pattern: LivelockPattern::Cyclic { period: 3 }, .. })));
    }

    #[test]
    fn clearing_resets_history() {
        let detector = LivelockDetector::new(LivelockConfig::default());
        detector.record("agent-a", "wf1", "t1", 1);
        detector.clear("agent-a");
        assert!(detector.records.get("agent-a").is_none());
    }
}
