/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C4: the evaluator. Schedules work, invokes function code, handles
//! restarts, cycle detection, keep-going/nokeep-going error bubbling, and
//! value-equality pruning.
//!
//! Dependency resolution is driven by plain recursive `async` calls: a node
//! waiting on a dep simply `.await`s that dep's own evaluation future, so
//! Rust's executor provides the "wake the rdep once its dep completes"
//! signal for free. A per-path stack (not a separate lazy sweep) is what
//! keeps this safe in the presence of cycles — see `handle_cycle` below.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use dupe::Dupe;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use frame_futures::CancellationContext;
use frame_futures::PoolLabel;
use frame_futures::WorkerPools;
use tokio::sync::Mutex as AsyncMutex;

use crate::cycles::CycleInfo;
use crate::data::EngineData;
use crate::deps::DepTracker;
use crate::environment::new_scratchpad;
use crate::environment::Environment;
use crate::environment::Outcome;
use crate::error::FrameError;
use crate::events::EventSink;
use crate::events::NullEventSink;
use crate::function::FunctionTable;
use crate::key::DynValue;
use crate::key::FamilyId;
use crate::key::FunctionClass;
use crate::key::KeyId;
use crate::key::KeyRegistry;
use crate::node::Node;
use crate::node::NodeOutcome;
use crate::node::NodeState;
use crate::node::NodeStore;
use crate::version::VersionNumber;

/// A single root's final result.
#[derive(Clone)]
pub struct RootResult {
    pub key: KeyId,
    pub outcome: EvalOutcome,
}

#[derive(Clone)]
pub enum EvalOutcome {
    Value(DynValue),
    Error(FrameError),
}

/// What `evaluate` returns: each root's outcome, plus a handle to walk the
/// final dependency graph.
pub struct EvaluationResult {
    pub roots: Vec<RootResult>,
    pub(crate) store: Arc<NodeStore>,
}

impl EvaluationResult {
    /// The final, as-evaluated dep list for `key` (empty if `key` was never
    /// reached this build).
    pub fn deps_of(&self, key: KeyId) -> Vec<KeyId> {
        self.store
            .get(key)
            .map(|n| n.read().deps.clone())
            .unwrap_or_default()
    }
}

pub struct EvaluationOptions {
    pub keep_going: bool,
    pub pools: Arc<WorkerPools>,
    pub event_sink: Arc<dyn EventSink>,
    pub cancellation: CancellationContext,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            keep_going: false,
            pools: Arc::new(
                WorkerPools::new(Default::default()).expect("default worker pools always build"),
            ),
            event_sink: Arc::new(NullEventSink),
            cancellation: CancellationContext::new(),
        }
    }
}

struct EvalCtx {
    store: Arc<NodeStore>,
    registry: Arc<KeyRegistry>,
    functions: Arc<FunctionTable>,
    data: Arc<EngineData>,
    pools: Arc<WorkerPools>,
    event_sink: Arc<dyn EventSink>,
    cancellation: CancellationContext,
    keep_going: bool,
    aborted: AtomicBool,
    version: VersionNumber,
    /// Per-key gate ensuring only one task runs a node's compute/check-deps
    /// at a time; concurrent callers pile up on the same lock and then take
    /// the already-`DONE` fast path.
    inflight: DashMap<KeyId, Arc<AsyncMutex<()>>>,
}

enum DepsCheck {
    NoChange,
    Changed,
}

/// The evaluator: holds no state of its own beyond what it's given each
/// call. `Frame` (in `engine.rs`) owns the long-lived registry/store/version
/// tracker across many `evaluate` calls.
pub struct Evaluator {
    store: Arc<NodeStore>,
    registry: Arc<KeyRegistry>,
    functions: Arc<FunctionTable>,
    data: Arc<EngineData>,
}

impl Evaluator {
    pub fn new(
        store: Arc<NodeStore>,
        registry: Arc<KeyRegistry>,
        functions: Arc<FunctionTable>,
        data: Arc<EngineData>,
    ) -> Self {
        Self {
            store,
            registry,
            functions,
            data,
        }
    }

    pub async fn evaluate(
        &self,
        roots: &[KeyId],
        version: VersionNumber,
        options: EvaluationOptions,
    ) -> EvaluationResult {
        let ctx = Arc::new(EvalCtx {
            store: self.store.dupe(),
            registry: self.registry.dupe(),
            functions: self.functions.dupe(),
            data: self.data.dupe(),
            pools: options.pools,
            event_sink: options.event_sink,
            cancellation: options.cancellation,
            keep_going: options.keep_going,
            aborted: AtomicBool::new(false),
            version,
            inflight: DashMap::new(),
        });

        let mut futures = FuturesUnordered::new();
        for &root in roots {
            futures.push(evaluate_key(ctx.dupe(), root, Vec::new()));
        }
        while futures.next().await.is_some() {}

        let mut results = Vec::with_capacity(roots.len());
        for &root in roots {
            let outcome = self
                .store
                .get(root)
                .and_then(|n| n.read().state.outcome().cloned())
                .map(|o| match o {
                    NodeOutcome::Value(v) => EvalOutcome::Value(v),
                    NodeOutcome::Error(e) => EvalOutcome::Error(e),
                })
                .unwrap_or_else(|| EvalOutcome::Error(FrameError::catastrophic("root never reached DONE")));
            results.push(RootResult { key: root, outcome });
        }

        EvaluationResult {
            roots: results,
            store: self.store.dupe(),
        }
    }
}

fn evaluate_key(ctx: Arc<EvalCtx>, key: KeyId, path: Vec<KeyId>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let node_arc = ctx.store.get_or_create(key);

        if is_fresh(&node_arc, ctx.version) {
            return;
        }

        if ctx.cancellation.is_cancelled() {
            commit_terminal(&ctx, key, &node_arc, FrameError::interrupted());
            return;
        }

        if !ctx.keep_going && ctx.aborted.load(Ordering::SeqCst) {
            commit_terminal(&ctx, key, &node_arc, FrameError::aborted());
            return;
        }

        let gate = ctx
            .inflight
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .dupe();
        let _permit = gate.lock().await;

        if is_fresh(&node_arc, ctx.version) {
            return;
        }

        let mut path = path;
        path.push(key);

        let was_dirty = matches!(node_arc.read().state, NodeState::Dirty(_));
        if was_dirty {
            match check_deps(&ctx, &node_arc, &path).await {
                DepsCheck::NoChange => {
                    let mut guard = node_arc.write();
                    if let NodeState::Dirty(outcome) = &guard.state {
                        let outcome = outcome.dupe();
                        guard.last_run = ctx.version;
                        guard.state = NodeState::Done(outcome);
                    }
                    return;
                }
                DepsCheck::Changed => {}
            }
        }

        run_compute_with_restarts(&ctx, key, &node_arc, path).await;
    })
}

fn is_fresh(node_arc: &Arc<parking_lot::RwLock<Node>>, version: VersionNumber) -> bool {
    let guard = node_arc.read();
    matches!(&guard.state, NodeState::Done(_)) && guard.last_run >= version
}

async fn check_deps(ctx: &Arc<EvalCtx>, node_arc: &Arc<parking_lot::RwLock<Node>>, path: &[KeyId]) -> DepsCheck {
    let (deps, snapshot) = {
        let guard = node_arc.read();
        (guard.deps.clone(), guard.dep_snapshot.clone())
    };
    if deps.is_empty() {
        return DepsCheck::Changed;
    }

    if !resolve_deps(ctx, &deps, path).await {
        return DepsCheck::Changed;
    }

    for (dep, old) in deps.iter().zip(snapshot.iter()) {
        let Some(dep_node) = ctx.store.get(*dep) else {
            return DepsCheck::Changed;
        };
        let current = dep_node.read().state.outcome().cloned();
        match (current, old) {
            (Some(NodeOutcome::Value(new_v)), NodeOutcome::Value(old_v)) => {
                let family = ctx.registry.family_of(*dep);
                let eq = ctx.functions.equality(family);
                if !eq(&new_v, old_v) {
                    return DepsCheck::Changed;
                }
            }
            _ => return DepsCheck::Changed,
        }
    }

    DepsCheck::NoChange
}

/// Evaluates every entry in `deps`, handling any cycle formed with `path`.
/// Returns `false` if a cycle was found (the caller should treat this as
/// "deps changed" rather than trying to compare snapshots further).
async fn resolve_deps(ctx: &Arc<EvalCtx>, deps: &[KeyId], path: &[KeyId]) -> bool {
    let mut saw_cycle = false;
    let mut futures = FuturesUnordered::new();
    for &dep in deps {
        if let Some(pos) = path.iter().position(|k| *k == dep) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(dep);
            handle_cycle(ctx, &cycle);
            saw_cycle = true;
            continue;
        }
        futures.push(evaluate_key(ctx.dupe(), dep, path.to_vec()));
    }
    while futures.next().await.is_some() {}
    !saw_cycle
}

async fn run_compute_with_restarts(
    ctx: &Arc<EvalCtx>,
    key: KeyId,
    node_arc: &Arc<parking_lot::RwLock<Node>>,
    path: Vec<KeyId>,
) {
    {
        let mut guard = node_arc.write();
        guard.state = NodeState::Enqueued;
    }

    let family = ctx.registry.family_of(key);
    let payload = ctx.registry.entry(key).payload.dupe();
    let scratchpad = new_scratchpad();

    loop {
        {
            let mut guard = node_arc.write();
            guard.state = NodeState::Evaluating;
        }

        let env = Environment::new(key, ctx.store.dupe(), ctx.data.dupe(), scratchpad.dupe());
        let record = ctx.registry.family_record(family);
        let outcome = invoke_on_pool(ctx, record.class, record.timeout, key, family, payload.dupe(), env.clone()).await;

        let requested = env.requested_deps();
        {
            let tracker = DepTracker::new(&ctx.store);
            for dep in &requested {
                tracker.add_dep(key, *dep);
            }
        }

        if env.any_missing() {
            if let Outcome::Done(Ok(_)) = outcome {
                let err = FrameError::contract(format!(
                    "function produced a value for {} after observing a Missing dependency",
                    key
                ));
                commit_error(ctx, key, node_arc, err, &env);
                return;
            }

            let missing: Vec<KeyId> = requested
                .iter()
                .copied()
                .filter(|d| {
                    ctx.store
                        .get(*d)
                        .map_or(true, |n| !n.read().state.is_done())
                })
                .collect();

            {
                let mut guard = node_arc.write();
                guard.state = NodeState::Enqueued;
            }

            if !resolve_deps(ctx, &missing, &path).await {
                // A cycle resolved this node out from under us.
                if node_arc.read().state.is_done() {
                    return;
                }
            }

            if node_arc.read().state.is_done() {
                return;
            }

            continue;
        }

        match outcome {
            Outcome::Done(Ok(value)) => commit_value(ctx, key, node_arc, value, &env),
            Outcome::Done(Err(e)) => commit_error(ctx, key, node_arc, e, &env),
            Outcome::Pending => {
                let err = FrameError::contract(format!(
                    "function for {} returned Pending without a Missing dependency",
                    key
                ));
                commit_error(ctx, key, node_arc, err, &env);
            }
        }
        return;
    }
}

async fn invoke_on_pool(
    ctx: &Arc<EvalCtx>,
    class: FunctionClass,
    timeout: Option<std::time::Duration>,
    key: KeyId,
    family: FamilyId,
    payload: Arc<dyn crate::key::KeyPayload>,
    env: Environment,
) -> Outcome<DynValue> {
    let compute = ctx.functions.compute(family);
    let label = match class {
        FunctionClass::Regular => PoolLabel::Regular,
        FunctionClass::CpuHeavy => PoolLabel::CpuHeavy,
        FunctionClass::Execution => PoolLabel::Execution,
    };

    let (tx, rx) = tokio::sync::oneshot::channel();
    let submitted = ctx.pools.submit(label, async move {
        let result = compute(payload, env).await;
        let _ = tx.send(result);
    });
    if submitted.is_err() {
        return Outcome::error(FrameError::catastrophic("worker pool rejected submission"));
    }

    // A timed-out invocation is left running on its pool thread (the
    // `ComputeFn` has no hook to preempt mid-instruction, same as the
    // evaluator's general cancellation story, §5 "suspension points"); its
    // eventual result is simply dropped when `tx.send` finds `rx` gone.
    let result = match timeout {
        Some(duration) => match tokio::time::timeout(duration, rx).await {
            Ok(inner) => inner,
            Err(_) => return Outcome::error(FrameError::timeout(key)),
        },
        None => rx.await,
    };

    match result {
        Ok(outcome) => outcome,
        Err(_) => Outcome::error(FrameError::catastrophic(
            "compute task was dropped before completing",
        )),
    }
}

fn commit_value(
    ctx: &Arc<EvalCtx>,
    _key: KeyId,
    node_arc: &Arc<parking_lot::RwLock<Node>>,
    value: DynValue,
    env: &Environment,
) {
    // Once we decide to commit, cancellation must not interrupt the write:
    // a cancelled build must never leave a node half-updated.
    let _critical = ctx.cancellation.try_enter_critical_section();

    let full_deps = node_arc.read().deps.clone();
    let dep_snapshot: Vec<NodeOutcome> = full_deps
        .iter()
        .map(|d| {
            ctx.store
                .get(*d)
                .and_then(|n| n.read().state.outcome().cloned())
                .unwrap_or_else(|| NodeOutcome::Error(FrameError::catastrophic("dep vanished before commit")))
        })
        .collect();

    {
        let mut guard = node_arc.write();
        guard.dep_snapshot = dep_snapshot;
        guard.last_run = ctx.version;
        guard.state = NodeState::Done(NodeOutcome::Value(value));
    }

    env.listener().flush(&*ctx.event_sink);
}

fn commit_error(
    ctx: &Arc<EvalCtx>,
    _key: KeyId,
    node_arc: &Arc<parking_lot::RwLock<Node>>,
    error: FrameError,
    env: &Environment,
) {
    let _critical = ctx.cancellation.try_enter_critical_section();

    if !ctx.keep_going && error.is_function_error() {
        ctx.aborted.store(true, Ordering::SeqCst);
    }

    {
        let mut guard = node_arc.write();
        guard.last_run = ctx.version;
        guard.state = NodeState::Done(NodeOutcome::Error(error));
    }

    env.listener().flush(&*ctx.event_sink);
}

/// Commits a terminal outcome (interrupted/aborted) without an `Environment`
/// to flush events from — these short-circuit before a function ever runs.
fn commit_terminal(ctx: &Arc<EvalCtx>, _key: KeyId, node_arc: &Arc<parking_lot::RwLock<Node>>, error: FrameError) {
    if node_arc.read().state.is_done() {
        return;
    }
    let mut guard = node_arc.write();
    if !guard.state.is_done() {
        guard.last_run = ctx.version;
        guard.state = NodeState::Done(NodeOutcome::Error(error));
    }
}

/// Invokes the cycle handler for every family in `cycle`, committing each
/// node's result directly: nodes on a cycle never reach an ordinary
/// `compute` call, since `resolve_deps` short-circuits at the cyclic edge.
fn handle_cycle(ctx: &Arc<EvalCtx>, cycle: &[KeyId]) {
    for &k in cycle {
        let node_arc = ctx.store.get_or_create(k);
        if node_arc.read().state.is_done() {
            continue;
        }
        let family = ctx.registry.family_of(k);
        let payload = ctx.registry.entry(k).payload.dupe();
        let cycle_handler = ctx.functions.cycle_handler(family);
        let info = CycleInfo {
            cycle: cycle.to_vec(),
        };
        let result = cycle_handler(payload, info);
        let outcome = match result {
            Ok(v) => NodeOutcome::Value(v),
            Err(e) => NodeOutcome::Error(e),
        };

        let mut guard = node_arc.write();
        if !guard.state.is_done() {
            guard.last_run = ctx.version;
            guard.state = NodeState::Done(outcome);
        }
    }
}
