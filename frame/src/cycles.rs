/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Lazy cycle detection: run only when the evaluator observes that the
//! roots have no runnable work but at least one root is still not `DONE`.
//! Grounded in the teacher's `cycles.rs` (which models the same
//! "check only when stuck" strategy, rather than eagerly detecting cycles on
//! every edge insertion).

use fnv::FnvHashSet;

use crate::key::KeyId;
use crate::node::NodeStore;

/// One closed walk found along unfinished dependency edges.
#[derive(Debug, Clone)]
pub struct CycleInfo {
    pub cycle: Vec<KeyId>,
}

/// Depth-first search over the dep edges of nodes that are not yet `DONE`,
/// starting from `pending_roots`. Returns every distinct closed walk
/// encountered; per property 6, this must include at least one walk
/// covering every cycle reachable from the roots.
pub fn detect_cycles(store: &NodeStore, pending_roots: &[KeyId]) -> Vec<CycleInfo> {
    let mut found = Vec::new();
    let mut globally_visited = FnvHashSet::default();

    for &root in pending_roots {
        if globally_visited.contains(&root) {
            continue;
        }
        let mut stack = Vec::new();
        let mut on_stack = FnvHashSet::default();
        dfs(store, root, &mut stack, &mut on_stack, &mut globally_visited, &mut found);
    }

    found
}

fn dfs(
    store: &NodeStore,
    key: KeyId,
    stack: &mut Vec<KeyId>,
    on_stack: &mut FnvHashSet<KeyId>,
    globally_visited: &mut FnvHashSet<KeyId>,
    found: &mut Vec<CycleInfo>,
) {
    if on_stack.contains(&key) {
        let start = stack.iter().position(|k| *k == key).unwrap_or(0);
        let mut cycle: Vec<KeyId> = stack[start..].to_vec();
        cycle.push(key);
        found.push(CycleInfo { cycle });
        return;
    }
    if globally_visited.contains(&key) {
        return;
    }

    let Some(node) = store.get(key) else {
        globally_visited.insert(key);
        return;
    };
    let (is_done, deps) = {
        let guard = node.read();
        (guard.state.is_done(), guard.deps.clone())
    };
    if is_done {
        globally_visited.insert(key);
        return;
    }

    stack.push(key);
    on_stack.insert(key);
    for dep in deps {
        dfs(store, dep, stack, on_stack, globally_visited, found);
    }
    on_stack.remove(&key);
    stack.pop();
    globally_visited.insert(key);
}
