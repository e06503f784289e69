/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! C2: the node store. An arena-style map from `KeyId` to `Node`, so that
//! the inherently cyclic forward/reverse dependency edges (§9 design note)
//! are stored as copyable handles rather than owning pointers.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use dupe::Dupe;
use parking_lot::RwLock;

use crate::error::FrameError;
use crate::key::DynValue;
use crate::key::KeyId;
use crate::version::VersionNumber;

/// Where a node sits in the lifecycle state machine from `spec.md` §3.
#[derive(Clone, Debug)]
pub enum NodeState {
    /// Never evaluated.
    New,
    /// Scheduled but not yet running.
    Enqueued,
    /// A function invocation is in flight for this node.
    Evaluating,
    /// Holds a committed result; `last_run` records the version it was
    /// committed at.
    Done(NodeOutcome),
    /// Previously `Done`; a reported change may invalidate it. Old outcome
    /// and dep list are retained so `CHECK_DEPS` can attempt reuse.
    Dirty(NodeOutcome),
    /// A dirty node whose deps are being re-verified against their current
    /// values before deciding whether to recompute.
    CheckDeps(NodeOutcome),
}

impl NodeState {
    pub fn is_done(&self) -> bool {
        matches!(self, NodeState::Done(_))
    }

    pub fn outcome(&self) -> Option<&NodeOutcome> {
        match self {
            NodeState::Done(o) | NodeState::Dirty(o) | NodeState::CheckDeps(o) => Some(o),
            NodeState::New | NodeState::Enqueued | NodeState::Evaluating => None,
        }
    }
}

/// A committed function result: either a value or an error, both treated as
/// first-class graph contents (never a panic).
#[derive(Clone, Dupe)]
pub enum NodeOutcome {
    Value(DynValue),
    Error(FrameError),
}

impl fmt::Debug for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Value(v) => write!(f, "Value({:?})", v),
            NodeOutcome::Error(e) => write!(f, "Error({:?})", e),
        }
    }
}

/// Per-key engine state. One `Node` exists per live `KeyId`.
pub struct Node {
    pub state: NodeState,
    /// Ordered, first-occurrence dependency list, preserved prefix-stable
    /// across restarts.
    pub deps: Vec<KeyId>,
    /// Not ordered: who depends on this node.
    pub rdeps: indexmap::IndexSet<KeyId>,
    /// What each entry in `deps` resolved to the last time this node ran,
    /// index-aligned with `deps`. Used by `CHECK_DEPS` to compare a dirty
    /// node's recorded deps against their current outcomes without a full
    /// recompute.
    pub dep_snapshot: Vec<NodeOutcome>,
    /// The version at which this node was last actually (re)computed.
    pub last_run: VersionNumber,
    /// Count of readers (rdeps in the current build) awaiting this node.
    pub pending_readers: u32,
}

impl Node {
    fn new() -> Self {
        Self {
            state: NodeState::New,
            deps: Vec::new(),
            rdeps: indexmap::IndexSet::new(),
            dep_snapshot: Vec::new(),
            last_run: VersionNumber::ZERO,
            pending_readers: 0,
        }
    }
}

/// C2: owns every `Node`, keyed by `KeyId`. Concurrent `get_or_create` for
/// the same key always returns the same node.
pub struct NodeStore {
    nodes: DashMap<KeyId, Arc<RwLock<Node>>>,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, key: KeyId) -> Arc<RwLock<Node>> {
        if let Some(existing) = self.nodes.get(&key) {
            return existing.dupe();
        }
        // `entry` takes the shard lock for the duration of the closure, so
        // two concurrent `get_or_create` calls for the same key never both
        // win: the second sees the first's insertion.
        self.nodes
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(Node::new())))
            .dupe()
    }

    pub fn get(&self, key: KeyId) -> Option<Arc<RwLock<Node>>> {
        self.nodes.get(&key).map(|n| n.dupe())
    }

    /// Only valid when the node has no rdeps; used by GC. Returns `false`
    /// (and leaves the node in place) if that invariant doesn't hold or
    /// another thread still holds a handle to it.
    pub fn remove(&self, key: KeyId) -> bool {
        let Some(entry) = self.nodes.get(&key) else {
            return true;
        };
        let node_arc = entry.dupe();
        drop(entry);

        if Arc::strong_count(&node_arc) > 2 {
            // The dashmap shard entry plus our local `node_arc` account for
            // two; a third means some other handle is live.
            return false;
        }
        {
            let guard = node_arc.read();
            if !guard.rdeps.is_empty() {
                return false;
            }
        }
        self.nodes.remove(&key);
        true
    }

    /// A snapshot of every live key, for dirtiness sweeps and GC.
    pub fn snapshot_keys(&self) -> Vec<KeyId> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn entry_mut(&self, key: KeyId) -> RefMut<'_, KeyId, Arc<RwLock<Node>>> {
        self.nodes
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(Node::new())))
    }
}
