/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Integration-level scenario and property tests exercised through `Frame`'s
//! public API only (no crate-internal access), covering the restart,
//! cycle-detection, and keep-going scenarios plus the dep-order-stability and
//! bidirectional-consistency properties that the inline unit tests in
//! `engine.rs` don't reach end to end.

use std::time::Duration;

use allocative::Allocative;
use async_trait::async_trait;
use derive_more::Display;
use frame::EvalOutcome;
use frame::Environment;
use frame::EvaluationOptions;
use frame::Frame;
use frame::FrameError;
use frame::GetOutcome;
use frame::Key;
use frame::KeyId;
use frame::Outcome;
use once_cell::sync::OnceCell;

#[derive(Allocative, Debug, PartialEq)]
struct NumValue(u32);

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Leaf({})", _0)]
struct Leaf(u32);

#[async_trait]
impl Key for Leaf {
    type Value = NumValue;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        Outcome::value(NumValue(self.0))
    }
}

// A key whose first invocation observes its only dependency as `Missing`,
// yields `Pending`, and is restarted once that dependency resolves — using a
// scratchpad counter to prove the restart actually happened rather than
// inferring it from the final value alone.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Waiter({})", _0)]
struct Waiter(KeyId);

#[derive(Allocative, Debug, PartialEq)]
struct WaiterValue {
    leaf_value: u32,
    invocations: usize,
}

#[async_trait]
impl Key for Waiter {
    type Value = WaiterValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let counter = env.state().get_or_insert_with(|| 0usize);
        *counter.lock() += 1;
        let invocations = *counter.lock();

        match env.get(self.0) {
            GetOutcome::Ready(v) => Outcome::value(WaiterValue {
                leaf_value: v.as_any().downcast_ref::<NumValue>().unwrap().0,
                invocations,
            }),
            GetOutcome::Missing => Outcome::Pending,
            GetOutcome::Failed(e) => Outcome::error(e),
        }
    }
}

#[tokio::test]
async fn restart_resolves_once_its_missing_dependency_becomes_ready() {
    let frame = Frame::builder().build();
    let leaf = frame.key_of(Leaf(9));
    let root = frame.key_of(Waiter(leaf));

    let result = frame.evaluate(&[root], EvaluationOptions::default()).await;

    let EvalOutcome::Value(v) = &result.roots[0].outcome else {
        panic!("expected a value, the dependency should have resolved across the restart");
    };
    let v = v.as_any().downcast_ref::<WaiterValue>().unwrap();
    assert_eq!(v.leaf_value, 9);
    // Exactly one restart: the first call observes `Missing`, the second
    // observes `Ready`. A third call would mean the engine kept restarting
    // after the dependency was already satisfied.
    assert_eq!(v.invocations, 2);
}

// A key that depends on itself via `Environment::self_key`. The evaluator's
// per-path-stack cycle check must catch this without a separate sweep and
// commit the default `Key::cycle` error rather than deadlocking.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "SelfLoop")]
struct SelfLoop;

#[async_trait]
impl Key for SelfLoop {
    type Value = NumValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        match env.get(env.self_key()) {
            GetOutcome::Ready(v) => Outcome::value(NumValue(v.as_any().downcast_ref::<NumValue>().unwrap().0)),
            GetOutcome::Missing => Outcome::Pending,
            GetOutcome::Failed(e) => Outcome::error(e),
        }
    }
}

#[tokio::test]
async fn a_key_depending_on_itself_is_reported_as_a_cycle_not_a_hang() {
    let frame = Frame::builder().build();
    let key = frame.key_of(SelfLoop);

    let result = frame.evaluate(&[key], EvaluationOptions::default()).await;

    let EvalOutcome::Error(e) = &result.roots[0].outcome else {
        panic!("expected a cycle error");
    };
    assert!(e.to_string().contains("cycle"));
}

// One root fails with a function error; a second, independent root that
// hasn't started its own dependency yet must be preemptively aborted when
// `keep_going` is off, but allowed to finish normally when it's on.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "FailFast")]
struct FailFast;

#[async_trait]
impl Key for FailFast {
    type Value = NumValue;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        Outcome::error(FrameError::function("fail_fast", anyhow::anyhow!("boom")))
    }
}

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "DelayLeaf")]
struct DelayLeaf;

#[async_trait]
impl Key for DelayLeaf {
    type Value = NumValue;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        Outcome::value(NumValue(1))
    }
}

// Sleeps before its first dependency check so `FailFast` (no deps, a single
// pool round-trip) reliably commits and sets the abort flag before this
// root's own dependency, `DelayLeaf`, is ever entered.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "SlowOk({})", _0)]
struct SlowOk(KeyId);

#[async_trait]
impl Key for SlowOk {
    type Value = NumValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        match env.get(self.0) {
            GetOutcome::Ready(v) => Outcome::value(NumValue(v.as_any().downcast_ref::<NumValue>().unwrap().0)),
            GetOutcome::Missing => Outcome::Pending,
            GetOutcome::Failed(e) => Outcome::error(e),
        }
    }
}

#[tokio::test]
async fn nokeep_going_aborts_unstarted_work_after_a_function_error() {
    let frame = Frame::builder().build();
    let fail = frame.key_of(FailFast);
    let delay = frame.key_of(DelayLeaf);
    let slow = frame.key_of(SlowOk(delay));

    let result = frame
        .evaluate(&[fail, slow], EvaluationOptions { keep_going: false, ..EvaluationOptions::default() })
        .await;

    let fail_outcome = result.roots.iter().find(|r| r.key == fail).unwrap();
    assert!(matches!(fail_outcome.outcome, EvalOutcome::Error(_)));

    let slow_outcome = result.roots.iter().find(|r| r.key == slow).unwrap();
    let EvalOutcome::Error(e) = &slow_outcome.outcome else {
        panic!("expected the independent root to be aborted rather than complete");
    };
    assert!(e.to_string().contains("aborted"));
}

#[tokio::test]
async fn keep_going_lets_independent_roots_finish_despite_a_sibling_failure() {
    let frame = Frame::builder().build();
    let fail = frame.key_of(FailFast);
    let delay = frame.key_of(DelayLeaf);
    let slow = frame.key_of(SlowOk(delay));

    let result = frame
        .evaluate(&[fail, slow], EvaluationOptions { keep_going: true, ..EvaluationOptions::default() })
        .await;

    let fail_outcome = result.roots.iter().find(|r| r.key == fail).unwrap();
    assert!(matches!(fail_outcome.outcome, EvalOutcome::Error(_)));

    let slow_outcome = result.roots.iter().find(|r| r.key == slow).unwrap();
    let EvalOutcome::Value(v) = &slow_outcome.outcome else {
        panic!("expected the independent root to complete under keep_going");
    };
    assert_eq!(v.as_any().downcast_ref::<NumValue>().unwrap().0, 1);
}

// Dep-order stability: a restart that re-declares a dependency it already
// saw must not reorder or duplicate it in the final dep list.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "ThreeDeps({}, {}, {})", _0, _1, _2)]
struct ThreeDeps(KeyId, KeyId, KeyId);

#[derive(Allocative, Debug, PartialEq)]
struct ThreeDepsValue(u32);

#[async_trait]
impl Key for ThreeDeps {
    type Value = ThreeDepsValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        // Declared in a fixed order every invocation, including restarts.
        let outcomes = env.get_many(&[self.0, self.1, self.2]);
        let mut total = 0u32;
        for outcome in &outcomes {
            match outcome {
                GetOutcome::Ready(v) => total += v.as_any().downcast_ref::<NumValue>().unwrap().0,
                GetOutcome::Missing => return Outcome::Pending,
                GetOutcome::Failed(e) => return Outcome::error(e.clone()),
            }
        }
        Outcome::value(ThreeDepsValue(total))
    }
}

#[tokio::test]
async fn dependency_declaration_order_survives_a_restart() {
    let frame = Frame::builder().build();
    let a = frame.key_of(Leaf(1));
    let b = frame.key_of(Leaf(2));
    let c = frame.key_of(Leaf(3));
    let root = frame.key_of(ThreeDeps(a, b, c));

    let result = frame.evaluate(&[root], EvaluationOptions::default()).await;

    let EvalOutcome::Value(v) = &result.roots[0].outcome else {
        panic!("expected a value");
    };
    assert_eq!(v.as_any().downcast_ref::<ThreeDepsValue>().unwrap().0, 6);
    assert_eq!(result.deps_of(root), vec![a, b, c]);
}

// Invalidating a leaf must propagate through the recorded rdep edge to its
// dependent, and an equal re-injected value must not.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "Doubler({})", _0)]
struct Doubler(KeyId);

#[derive(Allocative, Debug, PartialEq)]
struct DoublerValue(u32);

#[async_trait]
impl Key for Doubler {
    type Value = DoublerValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let counter = env.state().get_or_insert_with(|| 0usize);
        *counter.lock() += 1;

        match env.get(self.0) {
            GetOutcome::Ready(v) => Outcome::value(DoublerValue(v.as_any().downcast_ref::<NumValue>().unwrap().0 * 2)),
            GetOutcome::Missing => Outcome::Pending,
            GetOutcome::Failed(e) => Outcome::error(e),
        }
    }
}

#[tokio::test]
async fn changed_to_with_a_new_value_invalidates_the_dependent_via_its_rdep_edge() {
    let frame = Frame::builder().build();
    let leaf_key = frame.key_of(Leaf(5));
    let root = frame.key_of(Doubler(leaf_key));

    let r1 = frame.evaluate(&[root], EvaluationOptions::default()).await;
    let EvalOutcome::Value(v) = &r1.roots[0].outcome else {
        panic!("expected a value");
    };
    assert_eq!(v.as_any().downcast_ref::<DoublerValue>().unwrap().0, 10);

    // Re-injecting the same value must not mark the dependent dirty: the
    // rdep edge exists (proven below), but `changed_to` only walks it when
    // the family's own equality says the value actually changed.
    frame.changed_to(Leaf(5), NumValue(5));
    let r2 = frame.evaluate(&[root], EvaluationOptions::default()).await;
    let EvalOutcome::Value(v) = &r2.roots[0].outcome else {
        panic!("expected a value");
    };
    assert_eq!(v.as_any().downcast_ref::<DoublerValue>().unwrap().0, 10);

    // A genuinely different value must propagate through the rdep edge
    // recorded during the first evaluation and force a recompute.
    frame.changed_to(Leaf(5), NumValue(21));
    let r3 = frame.evaluate(&[root], EvaluationOptions::default()).await;
    let EvalOutcome::Value(v) = &r3.roots[0].outcome else {
        panic!("expected a value");
    };
    assert_eq!(v.as_any().downcast_ref::<DoublerValue>().unwrap().0, 42);
}

// A longer cycle (not just a self-loop) spanning three nodes must also be
// caught, and every node on the cycle must end up with a committed (error)
// outcome rather than being left dangling in `Enqueued`/`Evaluating`.
//
// A family's `compute` has no way to derive a sibling's `KeyId` from inside
// itself (only already-interned `KeyId`s can be read), so a genuine
// multi-node ring — where each node's dependency is only known once every
// node in the ring has been interned — is wired through a `OnceCell` set
// right after interning, not through the key's own payload.
#[derive(Allocative, Debug, PartialEq)]
struct RingValue(u32);

static RING: OnceCell<[KeyId; 3]> = OnceCell::new();

#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "RingNode({})", _0)]
struct RingNode(u8);

#[async_trait]
impl Key for RingNode {
    type Value = RingValue;

    async fn compute(&self, env: &Environment) -> Outcome<Self::Value> {
        let ring = RING.get().expect("ring installed before evaluate runs");
        let next = ring[(self.0 as usize + 1) % ring.len()];
        match env.get(next) {
            GetOutcome::Ready(v) => Outcome::value(RingValue(v.as_any().downcast_ref::<RingValue>().unwrap().0)),
            GetOutcome::Missing => Outcome::Pending,
            GetOutcome::Failed(e) => Outcome::error(e),
        }
    }
}

#[tokio::test]
async fn a_three_node_ring_is_detected_as_a_cycle_and_every_member_resolves() {
    let frame = Frame::builder().build();
    let n0 = frame.key_of(RingNode(0));
    let n1 = frame.key_of(RingNode(1));
    let n2 = frame.key_of(RingNode(2));
    let _ = RING.set([n0, n1, n2]);

    // Only `n0` is a root: the other two are discovered purely through
    // dependency resolution, so the per-path-stack cycle check (not a race
    // between independently-scheduled roots) is what's under test.
    let result = frame.evaluate(&[n0], EvaluationOptions::default()).await;

    assert!(matches!(result.roots[0].outcome, EvalOutcome::Error(_)));
    for node in [n0, n1, n2] {
        let outcome = frame.outcome_of(node);
        assert!(outcome.is_some(), "every ring member must reach a committed outcome");
        assert!(matches!(outcome.unwrap(), frame::NodeOutcome::Error(_)));
    }
}

// Per-function timeouts (§5), exercised end to end through `Frame::evaluate`
// rather than inline against the evaluator's internals.
#[derive(Allocative, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "NeverReturns")]
struct NeverReturns;

#[async_trait]
impl Key for NeverReturns {
    type Value = NumValue;

    async fn compute(&self, _env: &Environment) -> Outcome<Self::Value> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Outcome::value(NumValue(0))
    }

    fn timeout() -> Option<Duration> {
        Some(Duration::from_millis(10))
    }
}

#[tokio::test]
async fn a_timed_out_family_surfaces_a_timeout_error_through_the_public_api() {
    let frame = Frame::builder().build();
    let key = frame.key_of(NeverReturns);

    let result = frame.evaluate(&[key], EvaluationOptions::default()).await;
    let EvalOutcome::Error(e) = &result.roots[0].outcome else {
        panic!("expected a timeout error");
    };
    assert!(e.to_string().contains("timed out"));
}
