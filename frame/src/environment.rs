/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The function contract: `Environment` is everything a family's `compute`
//! closure is handed. `get`/`get_many` are deliberately synchronous — they
//! report `Missing` rather than suspending the calling future — so that
//! suspension is an explicit value a function inspects and acts on (§9:
//! "exception-driven dep-missing signalling" is replaced by an explicit sum
//! type, not by `async`/`await` quietly parking the task).
//!
//! `Environment` owns `Arc`s rather than borrowing, so a family's compute
//! future can be `'static` and cross a `tokio::spawn` boundary onto whichever
//! labeled pool its class routes to.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::data::EngineData;
use crate::error::FrameError;
use crate::events::ScopedEventSink;
use crate::key::DynValue;
use crate::key::KeyId;
use crate::node::NodeOutcome;
use crate::node::NodeStore;

/// The per-key outcome of a single `get`/`get_many` call.
#[derive(Clone)]
pub enum GetOutcome {
    Ready(DynValue),
    /// Only produced if the family declared it permits surfacing errors
    /// through `get` rather than having the evaluator bubble them.
    Failed(FrameError),
    /// The dependency is not yet `DONE`. The environment has already
    /// recorded `key` as requested-but-missing for this invocation; the
    /// function must return without producing a `Value`.
    Missing,
}

/// What a function invocation produced. `Pending` is the only legal return
/// once any `get`/`get_many` call reported `Missing` for this invocation —
/// the evaluator reads back which keys were requested (via the
/// `Environment`'s own bookkeeping, not from this value) and schedules a
/// restart once they resolve.
pub enum Outcome<V> {
    Done(Result<V, FrameError>),
    Pending,
}

impl<V> Outcome<V> {
    pub fn value(v: V) -> Self {
        Outcome::Done(Ok(v))
    }

    pub fn error(e: FrameError) -> Self {
        Outcome::Done(Err(e))
    }
}

type Scratchpad = Arc<Mutex<Option<Box<dyn std::any::Any + Send>>>>;

/// Handed to a family's `compute` closure. A restart gets a fresh
/// `Environment` (except for `state()`'s backing cell, which survives
/// restarts by design — the evaluator hands back the same `Scratchpad`).
#[derive(Clone)]
pub struct Environment {
    self_key: KeyId,
    store: Arc<NodeStore>,
    data: Arc<EngineData>,
    listener: Arc<ScopedEventSink>,
    requested: Arc<Mutex<Vec<KeyId>>>,
    any_missing: Arc<Mutex<bool>>,
    state: Scratchpad,
}

impl Environment {
    pub(crate) fn new(
        self_key: KeyId,
        store: Arc<NodeStore>,
        data: Arc<EngineData>,
        state: Scratchpad,
    ) -> Self {
        Self {
            self_key,
            store,
            data,
            listener: Arc::new(ScopedEventSink::new(self_key)),
            requested: Arc::new(Mutex::new(Vec::new())),
            any_missing: Arc::new(Mutex::new(false)),
            state,
        }
    }

    fn read_one(&self, key: KeyId) -> GetOutcome {
        self.requested.lock().push(key);
        match self
            .store
            .get(key)
            .and_then(|n| n.read().state.outcome().cloned())
        {
            Some(NodeOutcome::Value(v)) => GetOutcome::Ready(v),
            Some(NodeOutcome::Error(e)) => GetOutcome::Failed(e),
            None => {
                *self.any_missing.lock() = true;
                GetOutcome::Missing
            }
        }
    }

    /// Reads one dependency's current value, recording `key` as a forward
    /// dep of `self` regardless of the outcome.
    pub fn get(&self, key: KeyId) -> GetOutcome {
        self.read_one(key)
    }

    /// Batched `get`: same per-entry outcomes, recorded in the order given.
    pub fn get_many(&self, keys: &[KeyId]) -> Vec<GetOutcome> {
        keys.iter().map(|k| self.read_one(*k)).collect()
    }

    /// The per-invocation event sink. Buffered; replayed to the global sink
    /// only if this invocation ends up mattering.
    pub fn listener(&self) -> &ScopedEventSink {
        &self.listener
    }

    /// Immutable, globally precomputed configuration set at engine
    /// construction.
    pub fn semantics(&self) -> &EngineData {
        &self.data
    }

    /// A scratchpad that survives restarts of this same node, so a function
    /// can avoid redoing expensive setup work.
    pub fn state(&self) -> StateHandle<'_> {
        StateHandle { state: &self.state }
    }

    pub fn self_key(&self) -> KeyId {
        self.self_key
    }

    pub(crate) fn requested_deps(&self) -> Vec<KeyId> {
        self.requested.lock().clone()
    }

    pub(crate) fn any_missing(&self) -> bool {
        *self.any_missing.lock()
    }

    pub(crate) fn scratchpad(&self) -> Scratchpad {
        self.state.clone()
    }

    pub(crate) fn listener_handle(&self) -> Arc<ScopedEventSink> {
        self.listener.clone()
    }
}

/// Accessor for the per-node restart scratchpad.
pub struct StateHandle<'a> {
    state: &'a Mutex<Option<Box<dyn std::any::Any + Send>>>,
}

impl<'a> StateHandle<'a> {
    pub fn get_or_insert_with<T: Send + 'static>(
        &self,
        default: impl FnOnce() -> T,
    ) -> Arc<Mutex<T>> {
        // The scratchpad holds a type-erased `Arc<Mutex<T>>` so repeated
        // calls within and across restarts share the same cell.
        let mut guard = self.state.lock();
        if guard.is_none() {
            *guard = Some(Box::new(Arc::new(Mutex::new(default()))));
        }
        guard
            .as_ref()
            .unwrap()
            .downcast_ref::<Arc<Mutex<T>>>()
            .expect("state scratchpad requested at two different types for the same node")
            .clone()
    }

    pub fn clear(&self) {
        *self.state.lock() = None;
    }
}

pub(crate) fn new_scratchpad() -> Scratchpad {
    Arc::new(Mutex::new(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EngineDataBuilder;

    #[test]
    fn get_on_absent_key_reports_missing_and_records_request() {
        let store = Arc::new(NodeStore::new());
        let data = Arc::new(EngineDataBuilder::new().build());
        let env = Environment::new(KeyId { index: 0 }, store, data, new_scratchpad());

        let outcome = env.get(KeyId { index: 1 });
        assert!(matches!(outcome, GetOutcome::Missing));
        assert!(env.any_missing());
        assert_eq!(env.requested_deps(), vec![KeyId { index: 1 }]);
    }

    #[test]
    fn state_handle_persists_across_handles_sharing_the_same_cell() {
        let scratchpad = new_scratchpad();
        let store = Arc::new(NodeStore::new());
        let data = Arc::new(EngineDataBuilder::new().build());

        {
            let env = Environment::new(KeyId { index: 0 }, store.clone(), data.clone(), scratchpad.clone());
            let cell = env.state().get_or_insert_with(|| 0u32);
            *cell.lock() += 1;
        }
        {
            let env = Environment::new(KeyId { index: 0 }, store, data, scratchpad);
            let cell = env.state().get_or_insert_with(|| 99u32);
            assert_eq!(*cell.lock(), 1);
        }
    }
}
