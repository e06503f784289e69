/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C3: records forward/reverse edges and propagates completion signals to
//! rdeps. Edge updates always lock both endpoints in a fixed order (by
//! `KeyId`) to avoid deadlock, per `spec.md` §5.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::key::KeyId;
use crate::node::Node;
use crate::node::NodeStore;

/// Per-node wakeup, stored alongside the node so a suspended evaluation can
/// be woken once every outstanding dep it's waiting on signals completion.
pub struct DepTracker<'a> {
    store: &'a NodeStore,
}

impl<'a> DepTracker<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Self { store }
    }

    /// Idempotent: records `child` in `parent`'s ordered dep list on first
    /// call per build, and adds `parent` to `child`'s rdep set. Existing
    /// edges are reused across restarts; new deps are appended in
    /// declaration order (the "tie-break rule" of `spec.md` §4.3).
    pub fn add_dep(&self, parent: KeyId, child: KeyId) {
        if parent == child {
            // A key can't depend on itself; callers are expected not to
            // construct this, but guard defensively rather than deadlock
            // below on the fixed lock-ordering path.
            return;
        }

        let parent_node = self.store.get_or_create(parent);
        let child_node = self.store.get_or_create(child);

        // Fixed lock order (by key) across both endpoints.
        let (first, first_key, second, second_key) = if parent < child {
            (&parent_node, parent, &child_node, child)
        } else {
            (&child_node, child, &parent_node, parent)
        };
        let mut first_guard = first.write();
        let mut second_guard = second.write();

        let (parent_guard, child_guard): (&mut Node, &mut Node) = if first_key == parent {
            (&mut first_guard, &mut second_guard)
        } else {
            debug_assert_eq!(second_key, parent);
            (&mut second_guard, &mut first_guard)
        };

        if !parent_guard.deps.contains(&child) {
            parent_guard.deps.push(child);
        }
        child_guard.rdeps.insert(parent);
    }

    /// Notifies every rdep of `child` that it is now `DONE`. Each rdep's
    /// waiter (registered via [`NotifyTable::wait_for`]) is woken; it is up
    /// to the evaluator to decide whether all of *its* outstanding deps have
    /// now resolved.
    pub fn signal(&self, child: KeyId, waiters: &NotifyTable) {
        let Some(node) = self.store.get(child) else {
            return;
        };
        let rdeps: Vec<KeyId> = node.read().rdeps.iter().copied().collect();
        for rdep in rdeps {
            waiters.notify(rdep);
        }
    }

    /// Removes the edge `parent -> child` from both sides atomically, under
    /// the same fixed lock order as [`add_dep`](Self::add_dep).
    pub fn remove_dep(&self, parent: KeyId, child: KeyId) {
        let Some(parent_node) = self.store.get(parent) else {
            return;
        };
        let Some(child_node) = self.store.get(child) else {
            return;
        };

        let (first, second) = if parent < child {
            (&parent_node, &child_node)
        } else {
            (&child_node, &parent_node)
        };
        let mut first_guard = first.write();
        let mut second_guard = second.write();

        let (parent_guard, child_guard): (&mut Node, &mut Node) = if parent < child {
            (&mut first_guard, &mut second_guard)
        } else {
            (&mut second_guard, &mut first_guard)
        };

        parent_guard.deps.retain(|k| *k != child);
        child_guard.rdeps.shift_remove(&parent);
    }
}

/// A table of per-key wakeups. Kept separate from `Node` itself so the
/// evaluator can register interest in a key before that key's node exists.
#[derive(Default)]
pub struct NotifyTable {
    notifies: dashmap::DashMap<KeyId, Arc<Notify>>,
}

impl NotifyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_for(&self, key: KeyId) -> Arc<Notify> {
        self.notifies
            .entry(key)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, key: KeyId) {
        if let Some(notify) = self.notifies.get(&key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_dep_is_bidirectional_and_idempotent() {
        let store = NodeStore::new();
        let tracker = DepTracker::new(&store);
        let p = KeyId { index: 0 };
        let c = KeyId { index: 1 };

        tracker.add_dep(p, c);
        tracker.add_dep(p, c);

        let p_node = store.get(p).unwrap();
        let c_node = store.get(c).unwrap();
        assert_eq!(p_node.read().deps, vec![c]);
        assert!(c_node.read().rdeps.contains(&p));
    }

    #[test]
    fn dep_declaration_order_is_preserved() {
        let store = NodeStore::new();
        let tracker = DepTracker::new(&store);
        let p = KeyId { index: 0 };
        let a = KeyId { index: 1 };
        let b = KeyId { index: 2 };

        tracker.add_dep(p, a);
        tracker.add_dep(p, b);
        tracker.add_dep(p, a); // restart re-declares existing dep first

        let p_node = store.get(p).unwrap();
        assert_eq!(p_node.read().deps, vec![a, b]);
    }

    #[test]
    fn remove_dep_clears_both_sides() {
        let store = NodeStore::new();
        let tracker = DepTracker::new(&store);
        let p = KeyId { index: 0 };
        let c = KeyId { index: 1 };
        tracker.add_dep(p, c);
        tracker.remove_dep(p, c);

        assert!(store.get(p).unwrap().read().deps.is_empty());
        assert!(!store.get(c).unwrap().read().rdeps.contains(&p));
    }
}
