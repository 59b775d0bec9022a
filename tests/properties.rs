//! Quantified invariants and round-trip laws (spec §8 "Universal invariants",
//! "Round-trip / idempotence laws").

use async_trait::async_trait;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use workflow_kernel::*;

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

proptest! {
    /// createSnapshot followed by restoreSnapshot yields an equal world state,
    /// for arbitrary key/value sets.
    #[test]
    fn snapshot_round_trip_preserves_state(
        entries in prop::collection::hash_map("[a-z]{1,8}", 0i64..10_000, 0..8)
    ) {
        let (restored_entries, world_entries) = rt().block_on(async {
            let state_store = InMemoryStateStore::new();
            for (k, v) in &entries {
                state_store.create(k, serde_json::json!(v), HashMap::new()).await.unwrap();
            }
            let world_state = state_store.snapshot().await;

            let snapshot_store = InMemorySnapshotStore::new();
            let snap = snapshot_store
                .create_snapshot("wf", "t1", 0, world_state.clone(), HashMap::new(), true, HashMap::new())
                .await
                .unwrap();
            let restored = snapshot_store.restore_snapshot(snap.id).await.unwrap();

            (restored.world_state.entries, world_state.entries)
        });

        prop_assert_eq!(restored_entries, world_entries);
    }

    /// An outbox executor that fails on every attempt but the last runs
    /// exactly once per attempt while non-committed, and never again once
    /// a result is committed under that idempotency key.
    #[test]
    fn outbox_executor_runs_at_most_once_after_commit(fail_count in 0u32..4) {
        let (state, calls_after_commit, calls_after_replay, cached, committed_result) = rt().block_on(async {
            let outbox = InMemoryOutbox::new(OutboxConfig::default());
            let calls = Arc::new(AtomicU32::new(0));

            for _ in 0..=fail_count {
                let calls = calls.clone();
                let executor: outbox::Executor = Box::new(move |params| {
                    Box::pin(async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < fail_count {
                            Err(KernelError::classified(ErrorCode::ToolError, "retrying", None))
                        } else {
                            Ok(params)
                        }
                    })
                });
                let _ = outbox
                    .execute("wf", "t1", "tool", serde_json::json!({"n": fail_count}), "k", executor, 10)
                    .await;
            }

            let entry = outbox.get_by_idempotency_key("k").await.unwrap();
            let calls_after_commit = calls.load(Ordering::SeqCst);

            let executor: outbox::Executor = Box::new(|params| Box::pin(async move { Ok(params) }));
            let cached = outbox
                .execute("wf", "t1", "tool", serde_json::json!({"n": fail_count}), "k", executor, 10)
                .await
                .unwrap();
            let calls_after_replay = calls.load(Ordering::SeqCst);

            (entry.state, calls_after_commit, calls_after_replay, cached, entry.result.clone().unwrap())
        });

        prop_assert_eq!(state, OutboxState::Committed);
        prop_assert_eq!(cached, committed_result);
        prop_assert_eq!(calls_after_replay, calls_after_commit);
    }
}

/// A gate with `blockOnFailure=true` always blocks when any validator is
/// invalid, regardless of how many validators pass alongside it.
#[tokio::test]
async fn blocking_gate_blocks_whenever_any_validator_fails() {
    struct Toggle(bool);
    #[async_trait]
    impl Validator for Toggle {
        fn name(&self) -> &str {
            "toggle"
        }
        async fn validate(&self, _commit: &Commit) -> ValidationResult {
            if self.0 {
                ValidationResult::pass("ok")
            } else {
                ValidationResult::fail("no", ErrorCode::Conflict, "fix it")
            }
        }
    }

    for failing_count in 0..3 {
        let mut gate = Gate::new("g").blocking(true);
        for i in 0..3 {
            gate = gate.with_validator(Box::new(Toggle(i >= failing_count)));
        }
        let commit = Commit::new("c", serde_json::json!({}));
        let result = gate.run(&commit).await;
        if failing_count > 0 {
            assert_eq!(result.outcome, GateOutcome::Blocked);
        } else {
            assert_eq!(result.outcome, GateOutcome::Passed);
        }
    }
}
