/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The pool itself (§4.7): keeps up to `max_idle_per_key` idle workers per
//! [`WorkerKey`], evicting the least-recently-used one when a `release`
//! would exceed that, and spawning a fresh worker on `acquire` when none are
//! idle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use frame_futures::CancellationContext;
use parking_lot::Mutex;

use crate::error::WorkerPoolError;
use crate::key::WorkerKey;
use crate::key::WorkerSpec;
use crate::worker::ExecuteOutcome;
use crate::worker::Worker;

pub struct WorkerPoolConfig {
    pub max_idle_per_key: usize,
    pub acquire_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 4,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct KeySlot {
    /// Front is least-recently-released, back is most-recently-released.
    idle: VecDeque<Arc<Worker>>,
}

/// Pools long-lived worker subprocesses by [`WorkerKey`]. Cheap to clone
/// (wrap in an `Arc` at the call site); every method takes `&self`.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    slots: DashMap<WorkerKey, Mutex<KeySlot>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
        }
    }

    /// Returns an idle worker for `spec`'s key if one exists, otherwise
    /// spawns a new one. Bounded by `acquire_timeout`: a caller that can't
    /// get a worker within that window gets `AcquireTimedOut` back rather
    /// than blocking forever on a wedged spawn.
    pub async fn acquire(&self, spec: &WorkerSpec) -> Result<Arc<Worker>, WorkerPoolError> {
        let key = spec.key();
        if let Some(worker) = self.take_idle(&key) {
            return Ok(worker);
        }

        match tokio::time::timeout(self.config.acquire_timeout, Worker::spawn(spec)).await {
            Ok(result) => result.map(Arc::new),
            Err(_) => Err(WorkerPoolError::AcquireTimedOut(key)),
        }
    }

    /// Sends `payload` to `worker` and awaits its response, same semantics
    /// as [`Worker::execute`]. Kept on the pool (rather than leaving callers
    /// to reach for `Worker` directly) so a future caller that wants to
    /// instrument every execution in one place has a natural seam.
    pub async fn execute(
        &self,
        worker: &Worker,
        payload: Vec<u8>,
        cancellation: &CancellationContext,
    ) -> Result<ExecuteOutcome, WorkerPoolError> {
        worker.execute(payload, cancellation).await
    }

    /// Returns `worker` to the idle set for its key if `ok`, evicting the
    /// least-recently-used idle worker of that key if this would exceed
    /// `max_idle_per_key`. Drops (and so kills, via `Worker`'s `Drop`) the
    /// worker outright if `ok` is `false` — the caller observed a failure it
    /// doesn't trust the worker to have recovered from.
    pub fn release(&self, worker: Arc<Worker>, ok: bool) {
        if !ok {
            return;
        }
        let key = worker.key().clone();
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Mutex::new(KeySlot::default()));
        let mut guard = slot.lock();
        guard.idle.push_back(worker);
        while guard.idle.len() > self.config.max_idle_per_key {
            guard.idle.pop_front();
        }
    }

    fn take_idle(&self, key: &WorkerKey) -> Option<Arc<Worker>> {
        let slot = self.slots.get(key)?;
        let mut guard = slot.lock();
        guard.idle.pop_back()
    }

    /// Number of idle workers currently pooled under `key`, for tests and
    /// diagnostics.
    pub fn idle_count(&self, key: &WorkerKey) -> usize {
        self.slots.get(key).map(|s| s.lock().idle.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::key::ProtocolVariant;
    use crate::key::WireEncoding;
    use crate::sandbox::SandboxedSpec;

    fn cat_spec() -> WorkerSpec {
        WorkerSpec {
            family_tag: Arc::from("test"),
            program: PathBuf::from("/bin/cat"),
            argv: Vec::new(),
            env: BTreeMap::new(),
            sandbox: SandboxedSpec::unsandboxed(),
            protocol: ProtocolVariant::Singleplex,
            encoding: WireEncoding::Canonical,
            supports_cancellation: false,
        }
    }

    #[tokio::test]
    async fn acquire_spawns_when_nothing_idle_then_reuses_on_release() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let spec = cat_spec();
        let key = spec.key();

        let worker = pool.acquire(&spec).await.unwrap();
        assert_eq!(pool.idle_count(&key), 0);

        pool.release(worker, true);
        assert_eq!(pool.idle_count(&key), 1);

        let reused = pool.acquire(&spec).await.unwrap();
        assert_eq!(pool.idle_count(&key), 0);
        pool.release(reused, true);
    }

    #[tokio::test]
    async fn release_with_ok_false_does_not_pool_the_worker() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let spec = cat_spec();
        let key = spec.key();

        let worker = pool.acquire(&spec).await.unwrap();
        pool.release(worker, false);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn releasing_past_capacity_evicts_the_least_recently_used() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_idle_per_key: 2,
            ..WorkerPoolConfig::default()
        });
        let spec = cat_spec();
        let key = spec.key();

        for _ in 0..3 {
            let worker = pool.acquire(&spec).await.unwrap();
            pool.release(worker, true);
        }
        // Each iteration reuses the single idle worker before releasing it
        // again, so this only ever proves capacity isn't exceeded, not real
        // eviction; force three *concurrently held* workers to actually
        // test the cap.
        assert!(pool.idle_count(&key) <= 2);

        let a = pool.acquire(&spec).await.unwrap();
        let b = pool.acquire(&spec).await.unwrap();
        let c = pool.acquire(&spec).await.unwrap();
        pool.release(a, true);
        pool.release(b, true);
        pool.release(c, true);
        assert_eq!(pool.idle_count(&key), 2);
    }

    #[test]
    fn non_multiplex_spec_forces_singleplex_even_when_multiplex_was_requested() {
        let mut spec = cat_spec();
        spec.protocol = ProtocolVariant::Multiplex;
        assert_eq!(spec.non_multiplex().protocol, ProtocolVariant::Singleplex);
    }
}
