//! Property-based tests for the universal invariants of spec §8 (P1, P3,
//! P4, P7), exercised over `proptest`-generated inputs rather than fixed
//! examples. Seed-scenario tests (S1-S6) live alongside each module's own
//! `#[cfg(test)]` block, where the teacher's own tests sit closest to the
//! code they exercise; these cross-cutting invariants get their own file
//! instead, the way the teacher's `tests/test_flow.rs` holds behaviour that
//! spans more than one module.

use async_trait::async_trait;
use pocket_engine::prelude::*;
use pocket_engine::{fan_out, run_node};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------
// P1 — phase order: Prep precedes Exec precedes Post, for any input.
// ---------------------------------------------------------------------

struct OrderRecorder {
    order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl NodeBackend for OrderRecorder {
    async fn prep(&self, _ctx: &Ctx, _reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.order.lock().unwrap().push("prep");
        Ok(input)
    }

    async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        self.order.lock().unwrap().push("exec");
        Ok(prep_result)
    }

    async fn post(
        &self,
        _ctx: &Ctx,
        _writer: &StoreWriter,
        _input: Value,
        _prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.order.lock().unwrap().push("post");
        Ok((exec_result, Action::default_action()))
    }
}

proptest! {
    /// P1: whatever value flows through a node visit, the recorded call
    /// order is always prep, exec, post — exactly once each.
    #[test]
    fn phase_order_is_always_prep_exec_post(n in any::<i64>(), s in ".*") {
        let order = Arc::new(Mutex::new(Vec::new()));
        let node = NodeBuilder::new("recorder", OrderRecorder { order: order.clone() }).build();
        let store = Store::new();
        let ctx = Ctx::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(run_node(&node, &store, &ctx, json!({ "n": n, "s": s })))
            .unwrap();
        prop_assert_eq!(order.lock().unwrap().clone(), vec!["prep", "exec", "post"]);
    }
}

// ---------------------------------------------------------------------
// P3 — fan-out ordering: output index i always matches input index i,
// regardless of how long each item takes to complete.
// ---------------------------------------------------------------------

struct VariableDelay;

#[async_trait]
impl NodeBackend for VariableDelay {
    async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        // Items with a larger value sleep for a *shorter* time, so
        // completion order is deliberately scrambled relative to input
        // order.
        let n = prep_result.as_i64().unwrap_or(0);
        let delay_ms = 20u64.saturating_sub(n.unsigned_abs().min(20) as u64);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        Ok(prep_result)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]
    /// P3: for any sequence of up to 12 small integers, fan-out with
    /// `ordered=true` returns them in input order even though completion
    /// order is scrambled by `VariableDelay`.
    #[test]
    fn fan_out_preserves_input_order(values in proptest::collection::vec(0i64..20, 1..12)) {
        let node = NodeBuilder::new("delay", VariableDelay).build();
        let inputs: Vec<Value> = values.iter().map(|v| json!(v)).collect();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let out = rt
            .block_on(fan_out(
                node,
                Store::new(),
                Ctx::new(),
                inputs.clone(),
                FanOutOptions::new().concurrency(4),
            ))
            .unwrap();
        prop_assert_eq!(out, inputs);
    }
}

// ---------------------------------------------------------------------
// P4 — LRU eviction: inserting N+k distinct keys into a store bounded at
// N evicts exactly the k least-recently-accessed keys, once each.
// ---------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]
    /// P4: touching the first key after filling the store to capacity
    /// always spares it from eviction when one more distinct key arrives.
    #[test]
    fn lru_spares_the_most_recently_touched_key(capacity in 2usize..8, extra in 1usize..5) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        let store = Store::with_config(
            StoreConfig::new()
                .max_entries(capacity)
                .on_evict(move |k, _| evicted2.lock().unwrap().push(k.to_string())),
        );
        for i in 0..capacity {
            store.set(format!("k{i}"), json!(i));
        }
        // touch k0 so it becomes the most-recently-used entry.
        store.get("k0");
        for i in 0..extra {
            store.set(format!("new{i}"), json!(i));
        }
        prop_assert_eq!(store.get("k0"), (Some(json!(0)), true));
        prop_assert_eq!(evicted.lock().unwrap().len(), extra.min(capacity));
        prop_assert!(!evicted.lock().unwrap().contains(&"k0".to_string()));
    }
}

// ---------------------------------------------------------------------
// P7 — type soundness: any graph the validator accepts never fails at
// runtime with an edge-type-mismatch error (the engine performs no
// runtime type checking at all — soundness follows from the validator
// being the only gate — this test pins that design down against
// regression).
// ---------------------------------------------------------------------

struct Passthrough;

#[async_trait]
impl NodeBackend for Passthrough {
    async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        Ok(prep_result)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]
    /// P7: a chain of nodes whose declared types form a compatible chain
    /// (each concrete type matching the next, or `any` anywhere) always
    /// validates and always runs to completion without a validator error.
    #[test]
    fn validator_accepted_chains_never_fail_at_runtime(
        len in 1usize..6,
        use_any in proptest::collection::vec(any::<bool>(), 0..6),
    ) {
        let mut builders = Vec::new();
        let names: Vec<String> = (0..len).map(|i| format!("n{i}")).collect();
        for (i, name) in names.iter().enumerate() {
            let mut b = NodeBuilder::new(name.clone(), Passthrough);
            let any_here = use_any.get(i).copied().unwrap_or(false);
            if !any_here {
                b = b.input_type("chain").output_type("chain");
            }
            if i + 1 < len {
                b = b.on("default", names[i + 1].clone());
            }
            builders.push(b.build());
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let _ = counter.load(Ordering::SeqCst);

        let graph = Graph::new(builders, names[0].clone(), Store::new(), GraphOptions::default());
        prop_assert!(graph.is_ok());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(graph.unwrap().run(&Ctx::new(), json!("payload")));
        prop_assert!(result.is_ok());
    }
}
