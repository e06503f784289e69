/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The public entry point: [`Frame`] ties the registry, node store, version
//! tracker, and function table together, and [`Key`] is the ergonomic
//! typed surface collaborators implement. A `Key` impl is monomorphized
//! exactly once, at first use, into the type-erased closures installed in
//! the [`FunctionTable`](crate::function::FunctionTable) — every subsequent
//! dispatch is the tag-indexed lookup in `function.rs`, never a vtable call
//! through `Key` itself. Grounded in the teacher's `Dice::find_cache::<K>()`
//! lazy per-type cache, generalized from "one cache per type" to "one
//! family per type".

use std::any::TypeId;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use allocative::Allocative;
use async_trait::async_trait;
use dashmap::DashMap;
use dupe::Dupe;

use crate::cycles::detect_cycles;
use crate::cycles::CycleInfo;
use crate::data::EngineData;
use crate::data::EngineDataBuilder;
use crate::environment::Environment;
use crate::environment::Outcome;
use crate::error::FrameError;
use crate::error::FrameResult;
use crate::evaluator::EvaluationOptions;
use crate::evaluator::EvaluationResult;
use crate::evaluator::Evaluator;
use crate::function::ComputeFn;
use crate::function::CycleFn;
use crate::function::EqualityFn;
use crate::function::FunctionEntry;
use crate::function::FunctionTable;
use crate::key::DynValue;
use crate::key::ErrorPolicy;
use crate::key::FamilyId;
use crate::key::FunctionClass;
use crate::key::KeyId;
use crate::key::KeyRegistry;
use crate::key::Value;
use crate::node::NodeOutcome;
use crate::node::NodeState;
use crate::node::NodeStore;
use crate::version::ActiveVersionGuard;
use crate::version::VersionTracker;

/// The typed authoring surface for a function family. One `impl Key` per
/// kind of computation a collaborator wants memoized; `Frame::key_of`
/// registers it (once, lazily, the first time that type is seen) and hands
/// back an opaque [`KeyId`] for everything downstream.
///
/// `compute` is handed `&Environment` rather than returning a future that
/// "awaits" its dependencies: see `environment.rs` for why `get`/`get_many`
/// are synchronous and `Outcome::Pending` is how a function yields.
#[async_trait]
pub trait Key: Allocative + Debug + fmt::Display + Eq + Hash + Clone + Send + Sync + 'static {
    type Value: Value + PartialEq;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value>;

    /// Used for value-equality pruning (`spec.md` §4.2/§9). The default
    /// compares by `PartialEq`; override for a cheaper or coarser notion of
    /// "did this actually change".
    fn equality(a: &Self::Value, b: &Self::Value) -> bool {
        a == b
    }

    /// Invoked at most once per node caught in a cycle. The default reports
    /// the cycle as an error; a family with a legitimate fixed point (e.g.
    /// "my value when strongly-connected" style analyses) overrides this.
    fn cycle(&self, info: CycleInfo) -> FrameResult<Self::Value> {
        let trigger = info.cycle.first().copied().unwrap_or(KeyId::default());
        Err(FrameError::cycle(trigger, info.cycle))
    }

    fn class() -> FunctionClass {
        FunctionClass::Regular
    }

    fn error_policy() -> ErrorPolicy {
        ErrorPolicy::Persistent
    }

    /// §5 "per-function timeouts are expressed by the family": `None` (the
    /// default) means this family never times out on its own; the
    /// evaluator still honours cancellation regardless.
    fn timeout() -> Option<std::time::Duration> {
        None
    }
}

// `KeyId` has no public constructor, but `Key::cycle`'s default impl needs a
// placeholder if a cycle is somehow reported empty (never happens in
// practice: `detect_cycles`/`handle_cycle` always produce a non-empty list).
impl Default for KeyId {
    fn default() -> Self {
        KeyId { index: u32::MAX }
    }
}

/// Builds a [`Frame`], the only way to populate its [`EngineData`].
pub struct FrameBuilder {
    data: EngineDataBuilder,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            data: EngineDataBuilder::new(),
        }
    }

    pub fn set<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.data.set(value);
        self
    }

    pub fn build(self) -> Frame {
        Frame {
            registry: Arc::new(KeyRegistry::new()),
            functions: Arc::new(FunctionTable::new()),
            store: Arc::new(NodeStore::new()),
            data: Arc::new(self.data.build()),
            versions: Arc::new(VersionTracker::new()),
            families: Arc::new(DashMap::new()),
        }
    }
}

/// The engine. Cheap to clone (every field is an `Arc`); every clone shares
/// the same node store, registry, and version history.
#[derive(Clone, Dupe)]
pub struct Frame {
    registry: Arc<KeyRegistry>,
    functions: Arc<FunctionTable>,
    store: Arc<NodeStore>,
    data: Arc<EngineData>,
    versions: Arc<VersionTracker>,
    families: Arc<DashMap<TypeId, FamilyId>>,
}

impl Frame {
    pub fn builder() -> FrameBuilder {
        FrameBuilder::new()
    }

    fn ensure_family<K: Key>(&self) -> FamilyId {
        let type_id = TypeId::of::<K>();
        if let Some(existing) = self.families.get(&type_id) {
            return *existing;
        }

        // `entry` holds the shard lock for the duration of the closure, so
        // two racing first-uses of the same `K` never both install a
        // family (mirrors `NodeStore::get_or_create`'s same pattern).
        *self.families.entry(type_id).or_insert_with(|| {
            let family = self.registry.register_family(
                std::any::type_name::<K>(),
                K::class(),
                K::error_policy(),
                K::timeout(),
            );

            let compute: ComputeFn = Arc::new(move |payload, env| {
                Box::pin(async move {
                    let key = payload
                        .as_any()
                        .downcast_ref::<K>()
                        .expect("function table entry installed for the wrong payload type")
                        .clone();
                    match key.compute(&env).await {
                        Outcome::Done(Ok(value)) => Outcome::Done(Ok(Arc::new(value) as DynValue)),
                        Outcome::Done(Err(e)) => Outcome::Done(Err(e)),
                        Outcome::Pending => Outcome::Pending,
                    }
                })
            });

            let equality: EqualityFn = Arc::new(|a: &DynValue, b: &DynValue| {
                match (
                    a.as_any().downcast_ref::<K::Value>(),
                    b.as_any().downcast_ref::<K::Value>(),
                ) {
                    (Some(av), Some(bv)) => K::equality(av, bv),
                    _ => false,
                }
            });

            let cycle_handler: CycleFn = Arc::new(|payload, info| {
                let key = payload
                    .as_any()
                    .downcast_ref::<K>()
                    .expect("function table entry installed for the wrong payload type");
                key.cycle(info).map(|v| Arc::new(v) as DynValue)
            });

            self.functions.install(
                family,
                FunctionEntry {
                    compute,
                    equality,
                    cycle_handler,
                },
            );

            family
        })
    }

    /// Interns `key` under its family, registering the family on first use.
    pub fn key_of<K: Key>(&self, key: K) -> KeyId {
        let family = self.ensure_family::<K>();
        self.registry.key_of(family, key)
    }

    pub fn current_version(&self) -> crate::version::VersionNumber {
        self.versions.current()
    }

    /// Advances to a new version and pins it active for the duration of the
    /// returned guard. Call before `invalidate`-ing anything for this build.
    pub fn new_version(&self) -> ActiveVersionGuard {
        self.versions.next()
    }

    /// Marks `key` (and every node that transitively reads it) `Dirty`,
    /// preserving each one's last-committed outcome so `CHECK_DEPS` can
    /// attempt reuse instead of a blind recompute. Eager, whole-closure
    /// dirtying here is what lets value-equality pruning during evaluation
    /// converge without a second invalidation pass.
    pub fn invalidate(&self, key: KeyId) {
        let mut queue = VecDeque::from([key]);
        let mut seen = std::collections::HashSet::new();
        while let Some(k) = queue.pop_front() {
            if !seen.insert(k) {
                continue;
            }
            let Some(node_arc) = self.store.get(k) else {
                continue;
            };
            let rdeps: Vec<KeyId> = {
                let mut guard = node_arc.write();
                if let NodeState::Done(outcome) = &guard.state {
                    let outcome = outcome.dupe();
                    guard.state = NodeState::Dirty(outcome);
                    guard.rdeps.iter().copied().collect()
                } else {
                    Vec::new()
                }
            };
            queue.extend(rdeps);
        }
    }

    /// Directly updates `key`'s value without invoking its family's
    /// `compute`, mirroring the teacher's `changed_to`: used for injected
    /// keys whose new state is obtained by some external means (e.g. a
    /// filesystem stat performed by the dirtiness layer). Rdeps are only
    /// marked `Dirty` if the new value differs from the previous one by the
    /// family's own equality, same as value-equality pruning after a normal
    /// recompute.
    pub fn changed_to<K: Key>(&self, key: K, new_value: K::Value) -> KeyId {
        let family = self.ensure_family::<K>();
        let key_id = self.registry.key_of(family, key);
        let node_arc = self.store.get_or_create(key_id);
        let version = self.versions.current();

        let rdeps = {
            let mut guard = node_arc.write();
            let equal_to_previous = match guard.state.outcome() {
                Some(NodeOutcome::Value(old)) => old
                    .as_any()
                    .downcast_ref::<K::Value>()
                    .map(|old| K::equality(old, &new_value))
                    .unwrap_or(false),
                _ => false,
            };
            guard.state = NodeState::Done(NodeOutcome::Value(Arc::new(new_value) as DynValue));
            guard.last_run = version;
            if equal_to_previous {
                Vec::new()
            } else {
                guard.rdeps.iter().copied().collect::<Vec<KeyId>>()
            }
        };
        for rdep in rdeps {
            self.invalidate(rdep);
        }
        key_id
    }

    /// Evaluates `roots` at the current version, blocking until every root
    /// reaches `DONE`.
    pub async fn evaluate(&self, roots: &[KeyId], options: EvaluationOptions) -> EvaluationResult {
        let evaluator = Evaluator::new(
            self.store.dupe(),
            self.registry.dupe(),
            self.functions.dupe(),
            self.data.dupe(),
        );
        evaluator.evaluate(roots, self.versions.current(), options).await
    }

    /// Diagnostic: runs the lazy cycle sweep over `roots` without mutating
    /// anything. Useful for introspection tooling; the evaluator itself
    /// detects cycles eagerly along its own call stack (see `evaluator.rs`).
    pub fn debug_cycles(&self, roots: &[KeyId]) -> Vec<CycleInfo> {
        detect_cycles(&self.store, roots)
    }

    pub fn node_count(&self) -> usize {
        self.store.len()
    }

    pub fn wait_for_idle(&self) -> impl std::future::Future<Output = ()> + 'static {
        self.versions.wait_for_idle()
    }

    pub fn outcome_of(&self, key: KeyId) -> Option<NodeOutcome> {
        self.store.get(key).and_then(|n| n.read().state.outcome().cloned())
    }
}

#[cfg(test)]
mod tests {
    use allocative::Allocative;
    use derive_more::Display;

    use super::*;
    use crate::environment::GetOutcome;

    #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
    #[display(fmt = "Num({})", _0)]
    struct Num(u32);

    #[derive(Allocative, Debug, PartialEq)]
    struct NumValue(u32);

    #[async_trait]
    impl Key for Num {
        type Value = NumValue;

        async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
            Outcome::value(NumValue(self.0 * 2))
        }
    }

    // `SumOf` refers to its operands by already-interned `KeyId`, not by
    // typed sub-keys: a family's `compute` never needs a handle back to
    // `Frame` itself, since the caller resolves sub-keys before building the
    // parent key (mirrors how a target graph's keys carry resolved labels
    // for their deps rather than re-deriving them mid-compute).
    #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
    #[display(fmt = "SumOf({}, {})", _0, _1)]
    struct SumOf(KeyId, KeyId);

    #[derive(Allocative, Debug, PartialEq)]
    struct SumValue(u32);

    #[async_trait]
    impl Key for SumOf {
        type Value = SumValue;

        async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
            let outcomes = env.get_many(&[self.0, self.1]);
            let (GetOutcome::Ready(av), GetOutcome::Ready(bv)) = (&outcomes[0], &outcomes[1]) else {
                return Outcome::Pending;
            };
            let av = av.as_any().downcast_ref::<NumValue>().unwrap().0;
            let bv = bv.as_any().downcast_ref::<NumValue>().unwrap().0;
            Outcome::value(SumValue(av + bv))
        }
    }

    #[tokio::test]
    async fn diamond_shaped_graph_evaluates_to_a_single_value() {
        let frame = Frame::builder().build();

        let a = frame.key_of(Num(3));
        let b = frame.key_of(Num(4));
        let root = frame.key_of(SumOf(a, b));
        let result = frame.evaluate(&[root], EvaluationOptions::default()).await;

        let crate::evaluator::EvalOutcome::Value(v) = &result.roots[0].outcome else {
            panic!("expected a value");
        };
        assert_eq!(v.as_any().downcast_ref::<SumValue>().unwrap().0, 14);
    }

    #[tokio::test]
    async fn value_equality_pruning_stops_an_unaffected_rdep_from_recomputing() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::atomic::Ordering;

        #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
        #[display(fmt = "Leaf")]
        struct Leaf;

        #[derive(Allocative, Debug, PartialEq)]
        struct LeafValue(u32);

        #[async_trait]
        impl Key for Leaf {
            type Value = LeafValue;
            async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
                Outcome::value(LeafValue(0))
            }
        }

        static MIDDLE_RUNS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
        #[display(fmt = "Middle({})", _0)]
        struct Middle(KeyId);

        #[derive(Allocative, Debug)]
        struct MiddleValue {
            raw: u32,
            parity: bool,
        }
        impl PartialEq for MiddleValue {
            fn eq(&self, other: &Self) -> bool {
                self.raw == other.raw && self.parity == other.parity
            }
        }

        #[async_trait]
        impl Key for Middle {
            type Value = MiddleValue;

            async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
                let GetOutcome::Ready(leaf) = env.get(self.0) else {
                    return Outcome::Pending;
                };
                MIDDLE_RUNS.fetch_add(1, Ordering::SeqCst);
                let raw = leaf.as_any().downcast_ref::<LeafValue>().unwrap().0;
                Outcome::value(MiddleValue {
                    raw,
                    parity: raw % 2 == 0,
                })
            }

            // Coarser than derived `PartialEq`: only parity matters, so a
            // recompute that changes `raw` but not `parity` still counts as
            // "unchanged" for pruning.
            fn equality(a: &Self::Value, b: &Self::Value) -> bool {
                a.parity == b.parity
            }
        }

        static ROOT_RUNS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
        #[display(fmt = "Root({})", _0)]
        struct Root(KeyId);

        #[derive(Allocative, Debug, PartialEq)]
        struct RootValue(u32);

        #[async_trait]
        impl Key for Root {
            type Value = RootValue;

            async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
                let GetOutcome::Ready(middle) = env.get(self.0) else {
                    return Outcome::Pending;
                };
                ROOT_RUNS.fetch_add(1, Ordering::SeqCst);
                let raw = middle.as_any().downcast_ref::<MiddleValue>().unwrap().raw;
                Outcome::value(RootValue(raw))
            }
        }

        let frame = Frame::builder().build();
        let leaf = frame.changed_to(Leaf, LeafValue(4));
        let middle = frame.key_of(Middle(leaf));
        let root = frame.key_of(Root(middle));

        let r1 = frame.evaluate(&[root], EvaluationOptions::default()).await;
        let crate::evaluator::EvalOutcome::Value(v) = &r1.roots[0].outcome else {
            panic!("expected a value");
        };
        assert_eq!(v.as_any().downcast_ref::<RootValue>().unwrap().0, 4);
        assert_eq!(MIDDLE_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(ROOT_RUNS.load(Ordering::SeqCst), 1);

        // A new leaf value that is genuinely different (4 -> 6) but shares
        // the same parity forces `Middle` to recompute, but its recomputed
        // value is equal (by `Middle::equality`) to the one `Root` snapshot
        // during the first build: `CHECK_DEPS` must prune `Root`'s recompute
        // rather than re-running it.
        frame.changed_to(Leaf, LeafValue(6));
        let r2 = frame.evaluate(&[root], EvaluationOptions::default()).await;
        let crate::evaluator::EvalOutcome::Value(v) = &r2.roots[0].outcome else {
            panic!("expected a value");
        };
        // `Root`'s committed value is still the one from the first build:
        // it was never recomputed, so it still reflects the old `raw`.
        assert_eq!(v.as_any().downcast_ref::<RootValue>().unwrap().0, 4);
        assert_eq!(MIDDLE_RUNS.load(Ordering::SeqCst), 2);
        assert_eq!(ROOT_RUNS.load(Ordering::SeqCst), 1);
    }

    #[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
    #[display(fmt = "SlowNum({})", _0)]
    struct SlowNum(u32);

    #[async_trait]
    impl Key for SlowNum {
        type Value = NumValue;

        async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Outcome::value(NumValue(self.0))
        }

        fn timeout() -> Option<std::time::Duration> {
            Some(std::time::Duration::from_millis(10))
        }
    }

    #[tokio::test]
    async fn a_family_that_outlives_its_timeout_surfaces_a_timeout_error() {
        let frame = Frame::builder().build();
        let key = frame.key_of(SlowNum(7));

        let result = frame.evaluate(&[key], EvaluationOptions::default()).await;
        let crate::evaluator::EvalOutcome::Error(e) = &result.roots[0].outcome else {
            panic!("expected a timeout error");
        };
        assert!(e.to_string().contains("timed out"));
    }
}
